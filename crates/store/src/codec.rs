//! Cached hash layout of items and categories, plus the negative-cache sentinel.

use anyhow::{anyhow, Context, Result};
use hotrank_cache::Fields;
use hotrank_core::{Category, Counters, Item, Metric};

const NULL_FIELD: &str = "__state";
const NULL_VALUE: &str = "NULL";

/// Sentinel stored under an item or category key when the origin has no such row.
pub fn null_marker() -> Fields {
    Fields::from([(NULL_FIELD.to_string(), NULL_VALUE.to_string())])
}

pub fn is_null_marker(f: &Fields) -> bool {
    f.get(NULL_FIELD).map(|v| v == NULL_VALUE).unwrap_or(false)
}

pub fn encode_item(item: &Item) -> Fields {
    let mut f = Fields::new();
    f.insert("id".into(), item.id.to_string());
    f.insert("title".into(), item.title.clone());
    f.insert("content".into(), item.content.clone());
    if let Some(c) = item.category_id {
        f.insert("category_id".into(), c.to_string());
    }
    for m in Metric::ALL {
        f.insert(m.field().into(), item.counters.get(m).to_string());
    }
    f.insert("version".into(), item.version.to_string());
    f.insert("created_at".into(), item.created_at_ms.to_string());
    f
}

pub fn decode_item(f: &Fields) -> Result<Item> {
    let mut counters = Counters::default();
    for m in Metric::ALL {
        // Counters missing from a partially written hash read as zero.
        let v = match f.get(m.field()) {
            Some(raw) => parse(raw, m.field())?,
            None => 0,
        };
        counters.set(m, v);
    }
    Ok(Item {
        id: int(f, "id")?,
        title: f.get("title").cloned().unwrap_or_default(),
        content: f.get("content").cloned().unwrap_or_default(),
        category_id: f.get("category_id").map(|raw| parse(raw, "category_id")).transpose()?,
        counters,
        version: int(f, "version")?,
        created_at_ms: int(f, "created_at")?,
    })
}

pub fn encode_category(c: &Category) -> Fields {
    Fields::from([("id".to_string(), c.id.to_string()), ("name".to_string(), c.name.clone())])
}

pub fn decode_category(f: &Fields) -> Result<Category> {
    Ok(Category { id: int(f, "id")?, name: f.get("name").cloned().unwrap_or_default() })
}

fn int(f: &Fields, field: &str) -> Result<i64> {
    let raw = f.get(field).ok_or_else(|| anyhow!("cached hash lacks field {}", field))?;
    parse(raw, field)
}

fn parse(raw: &str, field: &str) -> Result<i64> {
    raw.parse::<i64>().with_context(|| format!("field {} is not an integer: {:?}", field, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_hash_layout() {
        let item = Item {
            id: 7,
            title: "t".into(),
            content: "c".into(),
            category_id: Some(3),
            counters: Counters { views: 5, supports: 1, opposes: 0, comments: 2, favorites: 0 },
            version: 4,
            created_at_ms: 1_700_000_000_000,
        };
        let f = encode_item(&item);
        assert_eq!(f.get("views").map(String::as_str), Some("5"));
        assert_eq!(f.get("created_at").map(String::as_str), Some("1700000000000"));
        assert!(!is_null_marker(&f));
        assert_eq!(decode_item(&f).unwrap(), item);
    }

    #[test]
    fn sentinel_is_not_an_item() {
        let f = null_marker();
        assert!(is_null_marker(&f));
        assert!(decode_item(&f).is_err());
    }

    #[test]
    fn garbage_counter_is_an_error() {
        let mut f = encode_item(&Item {
            id: 1,
            title: String::new(),
            content: String::new(),
            category_id: None,
            counters: Counters::default(),
            version: 0,
            created_at_ms: 0,
        });
        f.insert("views".into(), "lots".into());
        assert!(decode_item(&f).is_err());
    }
}
