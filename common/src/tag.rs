use std::collections::BTreeMap;

use crate::error::{AppError, Res};

const RATE_LIMIT_TAG: &str = "x-rate-limit";

/// Splits a `name:value` tag. The name is lower-cased; blank tags yield `None`.
pub fn parse(tag: &str) -> Res<Option<(String, String)>> {
    match tag.split_once(':') {
        Some((name, value)) => Ok(Some((
            name.trim().to_lowercase(),
            value.trim().to_string(),
        ))),
        None if tag.trim().is_empty() => Ok(None),
        None => Err(AppError::Validation(format!(
            "wrong tag value, no ':' in '{}'",
            tag
        ))),
    }
}

pub fn validate(tags: &[String]) -> Res<()> {
    for tag in tags {
        parse(tag)?;
    }
    Ok(())
}

/// Applies `update` on top of `old`. A tag with an empty value removes the name.
pub fn merge(old: &[String], update: &[String]) -> Res<Vec<String>> {
    let mut all = BTreeMap::new();
    for tag in old {
        if let Some((k, v)) = parse(tag)? {
            all.insert(k, v);
        }
    }
    for tag in update {
        if let Some((k, v)) = parse(tag)? {
            if v.is_empty() {
                all.remove(&k);
            } else {
                all.insert(k, v);
            }
        }
    }
    Ok(all.into_iter().map(|(k, v)| format!("{}:{}", k, v)).collect())
}

/// Per-key rate limit override carried in `x-rate-limit:<n>`.
pub fn rate_limit(tags: &[String]) -> Res<Option<i64>> {
    for tag in tags {
        if let Some((name, value)) = parse(tag)? {
            if name == RATE_LIMIT_TAG {
                return value.parse::<i64>().map(Some).map_err(|e| {
                    AppError::Validation(format!("wrong rate limit tag '{}': {}", tag, e))
                });
            }
        }
    }
    Ok(None)
}
