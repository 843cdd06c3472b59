//! Method registry: a method is a named, ordered subset of feature columns.

use crate::error::{ForensicsError, Result};

pub const KNOWN_METHODS: [&str; 9] = [
    "ela_only",
    "dwt_svd_only",
    "dwt_only",
    "cfa_only",
    "prnu_only",
    "mantra_only",
    "ela_dwt",
    "ela_dwt_svd",
    "fusion_all",
];

pub fn validate_method_name(method: &str) -> Result<()> {
    if KNOWN_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(ForensicsError::UnknownMethod(method.to_string()))
    }
}

fn with_prefix<'a>(columns: &'a [String], prefix: &'a str) -> impl Iterator<Item = &'a String> + 'a {
    columns.iter().filter(move |c| c.starts_with(prefix))
}

fn is_svd_column(column: &str) -> bool {
    column.contains("_sv_") || column.contains("singular")
}

/// Columns used by `method`, in table order within each signal group.
///
/// Fails with [`ForensicsError::UnknownMethod`] for unregistered names and
/// never falls back to an empty or default subset.
pub fn method_feature_columns(method: &str, columns: &[String]) -> Result<Vec<String>> {
    let ela = || with_prefix(columns, "ela_");
    let dwt = || with_prefix(columns, "dwt_");
    let dwt_no_svd = || dwt().filter(|c| !is_svd_column(c));

    let selected: Vec<&String> = match method {
        "ela_only" => ela().collect(),
        "dwt_svd_only" => dwt().collect(),
        "dwt_only" => dwt_no_svd().collect(),
        "cfa_only" => with_prefix(columns, "cfa_").collect(),
        "prnu_only" => with_prefix(columns, "prnu_").collect(),
        "mantra_only" => with_prefix(columns, "mantra_").collect(),
        "ela_dwt" => ela().chain(dwt_no_svd()).collect(),
        "ela_dwt_svd" => ela().chain(dwt()).collect(),
        "fusion_all" => ["ela_", "dwt_", "cfa_", "prnu_", "mantra_"]
            .into_iter()
            .flat_map(|prefix| with_prefix(columns, prefix))
            .collect(),
        other => return Err(ForensicsError::UnknownMethod(other.to_string())),
    };

    Ok(selected.into_iter().cloned().collect())
}

/// Like [`method_feature_columns`] but an empty subset is an error.
pub fn require_method_columns(method: &str, columns: &[String]) -> Result<Vec<String>> {
    let selected = method_feature_columns(method, columns)?;
    if selected.is_empty() {
        return Err(ForensicsError::NoFeatureColumns(method.to_string()));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        [
            "ela_mean_residual",
            "dwt_l1_lh_energy",
            "dwt_l1_lh_sv_mean",
            "dwt_detail_energy_ratio_0",
            "dwt_singular_global_mean",
            "cfa_var_mean",
            "prnu_residual_std",
            "mantra_score",
            "ela_p95_residual",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    #[test]
    fn ela_dwt_excludes_singular_columns() {
        let cols = method_feature_columns("ela_dwt", &columns()).unwrap();
        assert_eq!(
            cols,
            vec![
                "ela_mean_residual",
                "ela_p95_residual",
                "dwt_l1_lh_energy",
                "dwt_detail_energy_ratio_0"
            ]
        );
    }

    #[test]
    fn ela_dwt_svd_keeps_all_dwt_columns() {
        let cols = method_feature_columns("ela_dwt_svd", &columns()).unwrap();
        assert_eq!(cols.len(), 6);
        assert!(cols.contains(&"dwt_singular_global_mean".to_string()));
    }

    #[test]
    fn fusion_all_groups_by_signal() {
        let cols = method_feature_columns("fusion_all", &columns()).unwrap();
        assert_eq!(cols.len(), 9);
        assert_eq!(cols[1], "ela_p95_residual");
        assert_eq!(cols.last().unwrap(), "mantra_score");
    }

    #[test]
    fn unknown_method_is_an_error_not_an_empty_list() {
        let err = method_feature_columns("ela_plus_magic", &columns()).unwrap_err();
        assert!(matches!(err, ForensicsError::UnknownMethod(m) if m == "ela_plus_magic"));
    }

    #[test]
    fn empty_subset_is_rejected_when_required() {
        let only_ela = vec!["ela_mean_residual".to_string()];
        assert!(method_feature_columns("cfa_only", &only_ela).unwrap().is_empty());
        assert!(matches!(
            require_method_columns("cfa_only", &only_ela),
            Err(ForensicsError::NoFeatureColumns(_))
        ));
    }
}
