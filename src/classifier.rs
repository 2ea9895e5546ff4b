//! Turn recognized regions back into named form fields.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;

use crate::{
    form::{FieldKind, gstr1},
    prelude::*,
    recognizer::RegionText,
};

/// Below this confidence, a region with no text is treated as blank.
pub const MIN_CONFIDENCE: f32 = 40.0;

/// The longest numeric prefix of a string.
static LEADING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").expect("failed to compile regex")
});

/// The recognized regions of one page.
#[derive(Clone, Debug)]
pub struct PageText {
    pub page_number: u32,
    pub regions: Vec<RegionText>,
}

/// Field values found on the form.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct Fields {
    /// Text fields, as recognized.
    pub text: BTreeMap<String, String>,
    /// Amount fields. `None` means the field was read but didn't look like a
    /// number.
    pub amounts: BTreeMap<String, Option<f64>>,
}

/// The result of [`classify`].
#[derive(Debug, Default)]
pub struct Classification {
    pub fields: Fields,
    pub warnings: Vec<String>,
}

impl Classification {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Match each recognized region to its form field.
#[instrument(level = "debug", skip_all)]
pub fn classify(pages: &[PageText]) -> Classification {
    let mut out = Classification::default();
    for page in pages {
        for block in &page.regions {
            if block.confidence < MIN_CONFIDENCE && block.text.is_empty() {
                out.warn(format!(
                    "Low confidence and empty text, skipped. Confidence: {}",
                    block.confidence
                ));
                continue;
            }
            let Some(field) = gstr1::field_for_region(page.page_number, block.region)
            else {
                out.warn(format!(
                    "No matching schema for rectangle: {} with text: {}",
                    block.region, block.text
                ));
                continue;
            };
            match field.kind {
                FieldKind::Text => {
                    out.fields
                        .text
                        .insert(field.name.to_owned(), block.text.clone());
                }
                FieldKind::Amount => {
                    let amount = parse_amount(&block.text);
                    if amount.is_none() {
                        out.warn(format!(
                            "Failed to parse number for key: {} with text: {}",
                            field.name, block.text
                        ));
                    }
                    out.fields.amounts.insert(field.name.to_owned(), amount);
                }
            }
        }
    }
    out
}

/// Parse an amount like `12,34,567.00`. Commas and spaces are ignored, and
/// anything after the leading number is dropped, so `1,234.50 Rs` is
/// `1234.5`.
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned = text
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect::<String>();
    let number = LEADING_NUMBER.find(&cleaned)?;
    number.as_str().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::Region;

    fn block(region: Region, text: &str, confidence: f32) -> RegionText {
        RegionText {
            region,
            text: text.to_owned(),
            confidence,
        }
    }

    const GSTIN: Region = Region::new(289, 712, 344, 23);
    const VALUE4A: Region = Region::new(528, 757, 170, 21);

    #[test]
    fn parses_indian_grouping() {
        assert_eq!(parse_amount("12,34,567.00"), Some(1234567.0));
        assert_eq!(parse_amount(" 1 234.5 "), Some(1234.5));
        assert_eq!(parse_amount("0.00"), Some(0.0));
        assert_eq!(parse_amount("-12.5"), Some(-12.5));
    }

    #[test]
    fn keeps_the_leading_number_only() {
        assert_eq!(parse_amount("1,234.50Rs"), Some(1234.5));
        assert_eq!(parse_amount(".5-"), Some(0.5));
        assert_eq!(parse_amount("Rs 100"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-"), None);
    }

    #[test]
    fn classifies_text_and_amounts() {
        let pages = [PageText {
            page_number: 1,
            regions: vec![
                block(GSTIN, "27AAAAA0000A1Z5", 91.0),
                block(VALUE4A, "1,00,000.00", 88.0),
            ],
        }];
        let out = classify(&pages);
        assert_eq!(out.fields.text["gstin"], "27AAAAA0000A1Z5");
        assert_eq!(out.fields.amounts["value4a"], Some(100000.0));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn skips_blank_low_confidence_regions() {
        let pages = [PageText {
            page_number: 1,
            regions: vec![block(VALUE4A, "", -1.0), block(GSTIN, "", 95.0)],
        }];
        let out = classify(&pages);
        assert!(!out.fields.amounts.contains_key("value4a"));
        assert_eq!(out.fields.text["gstin"], "");
        assert_eq!(
            out.warnings,
            ["Low confidence and empty text, skipped. Confidence: -1"]
        );
    }

    #[test]
    fn low_confidence_text_is_still_used() {
        let pages = [PageText {
            page_number: 1,
            regions: vec![block(VALUE4A, "12", 10.0)],
        }];
        assert_eq!(classify(&pages).fields.amounts["value4a"], Some(12.0));
    }

    #[test]
    fn unknown_rectangles_and_bad_numbers_warn() {
        let pages = [PageText {
            page_number: 2,
            regions: vec![
                block(GSTIN, "x", 90.0),
                block(Region::new(132, 757, 170, 23), "abc", 90.0),
            ],
        }];
        let out = classify(&pages);
        assert_eq!(out.fields.amounts["value7"], None);
        assert_eq!(out.warnings.len(), 2);
        assert!(out.warnings[0].starts_with("No matching schema for rectangle: 289_712_344_23"));
        assert!(out.warnings[1].starts_with("Failed to parse number for key: value7"));
    }
}
