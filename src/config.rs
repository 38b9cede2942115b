use std::path::{Path, PathBuf};

/// Engine settings, filled in with chained setters.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub voucher_root: PathBuf,
    pub form_number_separator: String,
    pub split_type: String,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            voucher_root: PathBuf::from("vouchers"),
            form_number_separator: "-S".to_string(),
            split_type: "partial_approval".to_string(),
        }
    }
}

impl ApprovalConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_voucher_root(mut self, root: impl AsRef<Path>) -> Self {
        self.voucher_root = root.as_ref().to_path_buf();
        self
    }
    pub fn set_form_number_separator(mut self, separator: &str) -> Self {
        self.form_number_separator = separator.to_string();
        self
    }
    pub fn set_split_type(mut self, split_type: &str) -> Self {
        self.split_type = split_type.to_string();
        self
    }
}
