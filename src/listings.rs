use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// The slice of a listing row the generation payload needs. Fetched scoped to
/// the caller's own `owner_id`, so a row coming back at all is the
/// authorization check.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Characteristic {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Read seam for owned listings. Absent and not-owned collapse into `None`.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn fetch_owned(&self, owner_id: &str, listing_id: &str)
        -> anyhow::Result<Option<Listing>>;
}

impl Listing {
    /// Normalized fields the external generation service expects, assembled
    /// the same way for every job kind.
    pub fn webhook_fields(&self) -> Value {
        json!({
            "listingId": self.id,
            "title": self.title,
            "description": self.description.clone().unwrap_or_default(),
            "price": format_price(self.price, self.currency.as_deref()),
            "location": location_line(self.district.as_deref(), self.city.as_deref()),
            "propertyType": self.property_type.clone().unwrap_or_default(),
            "characteristics": flatten_characteristics(&self.characteristics),
        })
    }
}

/// "1250000" + "EUR" -> "1 250 000 EUR". Unknown price renders as an empty
/// string rather than a zero that could end up in generated copy.
pub fn format_price(amount: Option<i64>, currency: Option<&str>) -> String {
    let Some(amount) = amount else {
        return String::new();
    };

    let negative = amount < 0;
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(currency) = currency.map(str::trim).filter(|value| !value.is_empty()) {
        out.push(' ');
        out.push_str(currency);
    }
    out
}

/// Joins the non-empty location parts with ", ", most specific first.
pub fn location_line(district: Option<&str>, city: Option<&str>) -> String {
    [district, city]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Flattens tag-style characteristics into "name" / "name: value" strings.
pub fn flatten_characteristics(characteristics: &[Characteristic]) -> Vec<String> {
    characteristics
        .iter()
        .filter(|entry| !entry.name.trim().is_empty())
        .map(|entry| {
            match entry
                .value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                Some(value) => format!("{}: {}", entry.name.trim(), value),
                None => entry.name.trim().to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_groups_thousands_and_appends_currency() {
        assert_eq!(format_price(Some(1_250_000), Some("EUR")), "1 250 000 EUR");
        assert_eq!(format_price(Some(950), Some("USD")), "950 USD");
        assert_eq!(format_price(Some(1_000), None), "1 000");
        assert_eq!(format_price(None, Some("EUR")), "");
    }

    #[test]
    fn location_skips_empty_parts() {
        assert_eq!(location_line(Some("Kadıköy"), Some("Istanbul")), "Kadıköy, Istanbul");
        assert_eq!(location_line(None, Some("Istanbul")), "Istanbul");
        assert_eq!(location_line(Some("  "), None), "");
    }

    #[test]
    fn characteristics_flatten_to_labels() {
        let characteristics = vec![
            Characteristic {
                name: "bedrooms".to_string(),
                value: Some("3".to_string()),
            },
            Characteristic {
                name: "sea view".to_string(),
                value: None,
            },
            Characteristic {
                name: "  ".to_string(),
                value: Some("ignored".to_string()),
            },
        ];
        assert_eq!(
            flatten_characteristics(&characteristics),
            vec!["bedrooms: 3".to_string(), "sea view".to_string()]
        );
    }
}
