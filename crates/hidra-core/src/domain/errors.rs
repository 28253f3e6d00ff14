use std::error::Error;
use std::fmt::{Display, Formatter};

pub type HidraResult<T> = Result<T, HidraError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HidraErrorCategory {
    Configuration,
    DimensionMismatch,
    ShapeMismatch,
    InvalidRange,
    IoSystem,
    Internal,
}

impl HidraErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::DimensionMismatch => 3,
            Self::ShapeMismatch => 4,
            Self::InvalidRange => 5,
            Self::IoSystem => 6,
            Self::Internal => 7,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::DimensionMismatch => "DimensionMismatchError",
            Self::ShapeMismatch => "ShapeMismatchError",
            Self::InvalidRange => "InvalidRangeError",
            Self::IoSystem => "IoSystemError",
            Self::Internal => "InternalError",
        }
    }

    /// Contract violations the caller can fix by changing its inputs.
    pub const fn is_input_error(self) -> bool {
        !matches!(self, Self::IoSystem | Self::Internal)
    }
}

impl Display for HidraErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidraError {
    category: HidraErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl HidraError {
    pub fn new(
        category: HidraErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn configuration(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::Configuration, placeholder, message)
    }

    pub fn dimension_mismatch(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::DimensionMismatch, placeholder, message)
    }

    pub fn shape_mismatch(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::ShapeMismatch, placeholder, message)
    }

    pub fn invalid_range(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::InvalidRange, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::IoSystem, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(HidraErrorCategory::Internal, placeholder, message)
    }

    pub const fn category(&self) -> HidraErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder, self.message)
    }
}

impl Display for HidraError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for HidraError {}

#[cfg(test)]
mod tests {
    use super::{HidraError, HidraErrorCategory};

    #[test]
    fn exit_mapping_is_stable() {
        let cases = [
            (HidraErrorCategory::Configuration, 2, "ConfigurationError"),
            (
                HidraErrorCategory::DimensionMismatch,
                3,
                "DimensionMismatchError",
            ),
            (HidraErrorCategory::ShapeMismatch, 4, "ShapeMismatchError"),
            (HidraErrorCategory::InvalidRange, 5, "InvalidRangeError"),
            (HidraErrorCategory::IoSystem, 6, "IoSystemError"),
            (HidraErrorCategory::Internal, 7, "InternalError"),
        ];

        for (category, exit_code, name) in cases {
            assert_eq!(category.exit_code(), exit_code);
            assert_eq!(category.as_str(), name);
        }
    }

    #[test]
    fn io_and_internal_errors_are_not_input_errors() {
        assert!(HidraErrorCategory::ShapeMismatch.is_input_error());
        assert!(!HidraErrorCategory::IoSystem.is_input_error());
        assert!(!HidraErrorCategory::Internal.is_input_error());
    }

    #[test]
    fn error_renders_diagnostic_line() {
        let error = HidraError::invalid_range(
            "REDUCE.BIN_EDGES",
            "bin edges must be strictly increasing at index 3",
        );

        assert_eq!(error.exit_code(), 5);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [REDUCE.BIN_EDGES] bin edges must be strictly increasing at index 3"
        );
        assert_eq!(
            error.to_string(),
            "InvalidRangeError [REDUCE.BIN_EDGES] bin edges must be strictly increasing at index 3"
        );
    }
}
