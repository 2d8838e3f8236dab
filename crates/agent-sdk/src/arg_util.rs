use std::fmt::Debug;
use std::path::Path;

/// Argument validation utilities. These panic on validation failure;
/// callers use them only for conditions that indicate a programming error,
/// never for user input.
pub struct ArgUtil;

impl ArgUtil {
    /// Asserts that the value is `Some`. Panics with the parameter name if `None`.
    pub fn not_null<T>(value: &Option<T>, name: &str) {
        if value.is_none() {
            panic!("{name} must not be null (None)");
        }
    }

    /// Asserts that the string is not empty.
    pub fn not_null_or_empty(value: &str, name: &str) {
        if value.is_empty() {
            panic!("{name} must not be null or empty");
        }
    }

    /// Asserts that `expected == actual`.
    pub fn equal<T: PartialEq + Debug>(expected: &T, actual: &T, name: &str) {
        if expected != actual {
            panic!(
                "{name} does not equal expected value. Expected '{expected:?}'. Actual '{actual:?}'."
            );
        }
    }

    /// Asserts that the given path exists and is a file.
    pub fn file_exists(path: &Path, name: &str) {
        let path_str = path.display();
        if !path.is_file() {
            panic!("File not found: '{path_str}' (parameter '{name}')");
        }
    }

    /// Asserts that the given path exists and is a directory.
    pub fn directory_exists(path: &Path, name: &str) {
        let path_str = path.display();
        if !path.is_dir() {
            panic!("Directory not found: '{path_str}' (parameter '{name}')");
        }
    }
}
