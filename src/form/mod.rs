//! Fixed-layout forms: where each field lives, and what kind of value it
//! holds.

use crate::recognizer::Region;

pub mod gstr1;

/// The kind of value a field holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// Free text, copied as-is.
    Text,
    /// A rupee amount, like `12,34,567.00`.
    Amount,
}

/// A named field at a fixed position on a specific page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub page: u32,
    pub region: Region,
    pub kind: FieldKind,
}

impl Field {
    pub(crate) const fn text(name: &'static str, page: u32, region: Region) -> Self {
        Self {
            name,
            page,
            region,
            kind: FieldKind::Text,
        }
    }

    pub(crate) const fn amount(name: &'static str, page: u32, region: Region) -> Self {
        Self {
            name,
            page,
            region,
            kind: FieldKind::Amount,
        }
    }
}
