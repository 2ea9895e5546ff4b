//! The GSTR-1 summary form.
//!
//! Rectangles are in pixels on pages rendered at 144 DPI, as `(top, left,
//! width, height)`. Fields are listed page by page, in the order we ask the
//! OCR engine for them.

use super::{Field, FieldKind};
use crate::recognizer::Region;

/// Field holding the tax period ("April", "May", ...), which picks the
/// sheet row for all amounts.
pub const TAX_PERIOD: &str = "taxPeriod";

const fn r(top: u32, left: u32, width: u32, height: u32) -> Region {
    Region::new(top, left, width, height)
}

/// Every field on the form.
pub static FIELDS: &[Field] = &[
    // Page 1: taxpayer details and tables 4 to 6.
    Field::text("legalName", 1, r(314, 713, 887, 23)),
    Field::text(TAX_PERIOD, 1, r(233, 1458, 147, 23)),
    Field::text("financialYear", 1, r(203, 1455, 112, 28)),
    Field::text("gstin", 1, r(289, 712, 344, 23)),
    Field::amount("value4a", 1, r(528, 757, 170, 21)),
    Field::amount("value4b", 1, r(607, 757, 170, 21)),
    Field::amount("value5", 1, r(686, 757, 170, 21)),
    Field::amount("value6a", 1, r(765, 757, 170, 21)),
    Field::amount("value6b", 1, r(895, 757, 170, 21)),
    Field::amount("value6c", 1, r(1025, 757, 170, 21)),
    Field::amount("igst4a", 1, r(528, 927, 170, 21)),
    Field::amount("igst5", 1, r(686, 927, 170, 21)),
    Field::amount("igst6a", 1, r(765, 927, 170, 21)),
    Field::amount("igst6b", 1, r(895, 927, 170, 21)),
    Field::amount("igst6c", 1, r(1025, 927, 170, 21)),
    Field::amount("cgst4a", 1, r(528, 1097, 170, 21)),
    Field::amount("sgst4a", 1, r(528, 1267, 170, 21)),
    Field::amount("cess4a", 1, r(528, 1437, 170, 21)),
    Field::amount("cess5", 1, r(686, 1437, 170, 21)),
    Field::amount("cess6a", 1, r(765, 1437, 170, 21)),
    Field::amount("cess6b", 1, r(895, 1437, 170, 21)),
    Field::amount("cess6c", 1, r(1025, 1437, 170, 21)),
    // Page 2: tables 7 to 9A.
    Field::amount("value7", 2, r(132, 757, 170, 23)),
    Field::amount("igst7", 2, r(132, 927, 170, 23)),
    Field::amount("cgst7", 2, r(132, 1097, 170, 23)),
    Field::amount("sgst7", 2, r(132, 1267, 170, 23)),
    Field::amount("cess7", 2, r(132, 1437, 170, 23)),
    Field::amount("value8", 2, r(208, 757, 170, 23)),
    Field::amount("value9a_regular", 2, r(366, 757, 170, 21)),
    Field::amount("value9a_reverse", 2, r(472, 757, 170, 21)),
    Field::amount("value9a_b2cl", 2, r(578, 757, 170, 21)),
    Field::amount("value9a_expwpOrExpwop", 2, r(683, 757, 170, 21)),
    Field::amount("value9a_sezwpOrSezwop", 2, r(839, 757, 170, 21)),
    Field::amount("value9a_deemedExport", 2, r(996, 757, 170, 21)),
    // Page 3: credit and debit notes.
    Field::amount("value9b_cdnr", 3, r(131, 757, 170, 21)),
    Field::amount("value9b_cdnur", 3, r(421, 757, 170, 21)),
    Field::amount("value9c_cdnra", 3, r(603, 757, 170, 21)),
    Field::amount("value9c_cdnura", 3, r(1006, 757, 170, 21)),
    Field::amount("igst9b_cdnr", 3, r(131, 927, 170, 21)),
    Field::amount("igst9b_cdnur", 3, r(421, 927, 170, 21)),
    Field::amount("cgst9b_cdnr", 3, r(131, 1096, 170, 21)),
    Field::amount("sgst9b_cdnr", 3, r(131, 1267, 170, 21)),
    Field::amount("cess9b_cdnr", 3, r(131, 1437, 170, 21)),
    Field::amount("cess9b_cdnur", 3, r(421, 1437, 170, 21)),
    // Page 4: nil-rated supplies and advances.
    Field::amount("value10", 4, r(263, 757, 170, 21)),
    Field::amount("value11a1_11a2", 4, r(368, 757, 170, 21)),
    Field::amount("value11b1_11b2", 4, r(447, 757, 170, 21)),
];

/// Sheet cells that hold the text fields.
pub static TEXT_CELLS: &[(&str, &str)] = &[
    ("legalName", "A1"),
    (TAX_PERIOD, "A2"),
    ("financialYear", "A3"),
    ("gstin", "A4"),
];

/// Sheet columns, and the amount fields summed into each.
pub static AMOUNT_COLUMNS: &[(&str, &[&str])] = &[
    ("B", &["value4a"]),
    ("C", &["value4b"]),
    ("D", &["value5"]),
    ("E", &["value7"]),
    ("F", &["value6a", "value6b", "value6c"]),
    ("G", &["value8"]),
    ("H", &["value9a_regular", "value9a_reverse", "value9a_b2cl"]),
    (
        "I",
        &[
            "value9a_expwpOrExpwop",
            "value9a_sezwpOrSezwop",
            "value9a_deemedExport",
        ],
    ),
    ("K", &["value9b_cdnr", "value9b_cdnur"]),
    ("L", &["value9c_cdnra", "value9c_cdnura", "value10"]),
    ("M", &["value11a1_11a2"]),
    ("N", &["value11b1_11b2"]),
    ("P", &["igst4a", "igst5", "igst6a", "igst6b", "igst6c", "igst7"]),
    ("Q", &["cgst4a", "cgst7"]),
    ("R", &["sgst4a", "sgst7"]),
    ("S", &["cess4a", "cess5", "cess6a", "cess6b", "cess6c", "cess7"]),
    ("U", &["igst9b_cdnr", "igst9b_cdnur"]),
    ("V", &["cgst9b_cdnr"]),
    ("W", &["sgst9b_cdnr"]),
    ("X", &["cess9b_cdnr", "cess9b_cdnur"]),
];

/// The rectangles to recognize on `page`, in field order, or `None` if the
/// page has no fields.
pub fn rectangles_for_page(page: u32) -> Option<Vec<Region>> {
    let regions = FIELDS
        .iter()
        .filter(|f| f.page == page)
        .map(|f| f.region)
        .collect::<Vec<_>>();
    (!regions.is_empty()).then_some(regions)
}

/// Find the field at exactly `region` on `page`.
pub fn field_for_region(page: u32, region: Region) -> Option<&'static Field> {
    FIELDS
        .iter()
        .find(|f| f.page == page && f.region == region)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn field_named(name: &str) -> Option<&'static Field> {
        FIELDS.iter().find(|f| f.name == name)
    }

    fn is_amount(name: &str) -> bool {
        field_named(name).is_some_and(|f| f.kind == FieldKind::Amount)
    }

    #[test]
    fn pages_one_to_four_have_fields() {
        let counts = (1..=4)
            .map(|page| rectangles_for_page(page).map_or(0, |r| r.len()))
            .collect::<Vec<_>>();
        assert_eq!(counts, [22, 12, 10, 3]);
        assert_eq!(rectangles_for_page(0), None);
        assert_eq!(rectangles_for_page(5), None);
    }

    #[test]
    fn rectangles_are_in_field_order() {
        let page2 = rectangles_for_page(2).unwrap();
        assert_eq!(page2[0], Region::new(132, 757, 170, 23));
        assert_eq!(page2[11], Region::new(996, 757, 170, 21));
    }

    #[test]
    fn names_and_rectangles_are_unique() {
        let names = FIELDS.iter().map(|f| f.name).collect::<HashSet<_>>();
        assert_eq!(names.len(), FIELDS.len());
        let rects = FIELDS
            .iter()
            .map(|f| (f.page, f.region))
            .collect::<HashSet<_>>();
        assert_eq!(rects.len(), FIELDS.len());
    }

    #[test]
    fn reverse_lookup_finds_fields() {
        let field = field_for_region(1, Region::new(289, 712, 344, 23)).unwrap();
        assert_eq!(field.name, "gstin");
        assert_eq!(field.kind, FieldKind::Text);
        assert!(field_for_region(2, Region::new(289, 712, 344, 23)).is_none());
        assert!(field_for_region(1, Region::new(289, 712, 344, 24)).is_none());
    }

    #[test]
    fn sheet_maps_only_name_known_fields() {
        for (name, _) in TEXT_CELLS {
            assert_eq!(field_named(name).map(|f| f.kind), Some(FieldKind::Text));
        }
        let mut mapped = HashSet::new();
        for (_, names) in AMOUNT_COLUMNS {
            for name in *names {
                assert!(is_amount(name), "{name} is not an amount field");
                assert!(mapped.insert(*name), "{name} is mapped twice");
            }
        }
        let amounts = FIELDS
            .iter()
            .filter(|f| f.kind == FieldKind::Amount)
            .count();
        assert_eq!(mapped.len(), amounts);
    }
}
