use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CostError {
    /// The client sent something the cost cannot be computed from.
    #[error("{0}")]
    Input(String),
    /// The extractor itself failed.
    #[error("{0}")]
    Service(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub cost: f64,
    /// Payload excerpt stored with the request log.
    pub value: Option<String>,
}

/// Computes the credit cost of a request body.
#[async_trait]
pub trait CostExtractor: Send + Sync {
    fn name(&self) -> String;

    async fn get(&self, name: &str, content: &[u8]) -> Result<Extracted, CostError>;
}

/// Every call costs the same.
pub struct FixedCost(pub f64);

#[async_trait]
impl CostExtractor for FixedCost {
    fn name(&self) -> String {
        format!("Fixed({})", self.0)
    }

    async fn get(&self, _name: &str, _content: &[u8]) -> Result<Extracted, CostError> {
        Ok(Extracted {
            cost: self.0,
            value: None,
        })
    }
}

/// Cost is the number of characters in a top level JSON string field.
pub struct JsonFieldLength {
    field: String,
}

impl JsonFieldLength {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

#[async_trait]
impl CostExtractor for JsonFieldLength {
    fn name(&self) -> String {
        format!("JsonField({})", self.field)
    }

    async fn get(&self, _name: &str, content: &[u8]) -> Result<Extracted, CostError> {
        let body: serde_json::Value = serde_json::from_slice(content)
            .map_err(|e| CostError::Input(format!("can't parse JSON: {}", e)))?;
        match body.get(&self.field) {
            Some(serde_json::Value::String(text)) => Ok(Extracted {
                cost: text.chars().count() as f64,
                value: Some(text.clone()),
            }),
            Some(_) => Err(CostError::Input(format!("field '{}' is not a string", self.field))),
            None => Err(CostError::Input(format!("no field '{}'", self.field))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_characters_not_bytes() {
        let ex = JsonFieldLength::new("text");
        let got = ex.get("/tts", r#"{"text": "labas ąčę", "voice": 1}"#.as_bytes()).await.unwrap();
        assert_eq!(got.cost, 9.0);
        assert_eq!(got.value.as_deref(), Some("labas ąčę"));
    }

    #[tokio::test]
    async fn bad_input_is_an_input_error() {
        let ex = JsonFieldLength::new("text");
        assert!(matches!(ex.get("", b"{oops").await, Err(CostError::Input(_))));
        assert!(matches!(ex.get("", br#"{"other":"x"}"#).await, Err(CostError::Input(_))));
        assert!(matches!(ex.get("", br#"{"text":5}"#).await, Err(CostError::Input(_))));
    }

    #[tokio::test]
    async fn fixed_cost_ignores_body() {
        assert_eq!(FixedCost(2.5).get("", b"").await.unwrap().cost, 2.5);
    }
}
