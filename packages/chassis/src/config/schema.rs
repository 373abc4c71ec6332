//! Field descriptor tables driving config binding.
//!
//! The original metadata lived in struct tags; here every config section
//! declares a static descriptor table enumerating its fields. The binder
//! walks the table against the raw YAML node before handing the patched
//! node to serde.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Scalar kind of a configuration field, used to parse default literals
/// and to decide what counts as an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    UInt,
    Float,
    Bool,
    /// Stored in YAML as a duration literal (`"300ms"`, `"5m"`) or a number
    /// of seconds; see [`crate::config::duration`].
    Duration,
    /// Sequences have no default literals; empty means missing or zero-length.
    List,
}

/// Compile-time metadata for one field of a config section.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub kind: FieldKind,
    pub default: Option<&'static str>,
    pub required: bool,
    pub choices: &'static [&'static str],
}

impl FieldSpec {
    #[must_use]
    pub const fn new(key: &'static str, kind: FieldKind) -> Self {
        Self {
            key,
            kind,
            default: None,
            required: false,
            choices: &[],
        }
    }

    #[must_use]
    pub const fn with_default(mut self, literal: &'static str) -> Self {
        self.default = Some(literal);
        self
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub const fn with_choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = choices;
        self
    }
}

/// One entry of a section's descriptor table: a scalar field or a nested
/// sub-section (whose errors are flattened as `parent.field`).
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    Field(FieldSpec),
    Section {
        key: &'static str,
        entries: &'static [Entry],
    },
}

/// A configuration section that can be bound from a YAML node.
///
/// `Default` supplies the pre-bind starting values, the descriptor table
/// supplies defaults/required/choices, and serde performs the final typed
/// decode. Sections with no declarative metadata may return an empty table.
pub trait Bindable: Default + Serialize + DeserializeOwned {
    fn schema() -> &'static [Entry] {
        &[]
    }
}
