//! Feature-table assembly and the method registry.

pub mod methods;
pub mod table;

pub use methods::{KNOWN_METHODS, method_feature_columns, require_method_columns};
pub use table::{FeatureRow, FeatureTable, ManifestRow, Split, SplitData, build_feature_table, read_manifest};
