use serde_json::{json, Value};

/// Closed filter expression language for vector search: equality, `in`,
/// `not-in`, `not-equal`, combined by conjunction only. Anything richer
/// belongs in the relational store, not the ANN index.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Ne { field: String, value: Value },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn within(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In {
            field: field.into(),
            values,
        });
        self
    }

    pub fn not_within(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::NotIn {
            field: field.into(),
            values,
        });
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ne {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Serialize into the Qdrant filter JSON shape. Positive conditions land
    /// in `must`, negated ones in `must_not`.
    pub fn to_qdrant(&self) -> Value {
        let mut must = Vec::new();
        let mut must_not = Vec::new();

        for condition in &self.conditions {
            match condition {
                Condition::Eq { field, value } => {
                    must.push(json!({"key": field, "match": {"value": value}}));
                }
                Condition::In { field, values } => {
                    must.push(json!({"key": field, "match": {"any": values}}));
                }
                Condition::NotIn { field, values } => {
                    must_not.push(json!({"key": field, "match": {"any": values}}));
                }
                Condition::Ne { field, value } => {
                    must_not.push(json!({"key": field, "match": {"value": value}}));
                }
            }
        }

        let mut filter = serde_json::Map::new();
        if !must.is_empty() {
            filter.insert("must".to_string(), Value::Array(must));
        }
        if !must_not.is_empty() {
            filter.insert("must_not".to_string(), Value::Array(must_not));
        }

        Value::Object(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_serializes_to_must_match() {
        let filter = Filter::new().eq("document_id", "PP_31_2013");
        let json = filter.to_qdrant();
        assert_eq!(json["must"][0]["key"], "document_id");
        assert_eq!(json["must"][0]["match"]["value"], "PP_31_2013");
    }

    #[test]
    fn test_in_serializes_to_any() {
        let filter = Filter::new().within("tier", vec![json!("public"), json!("internal")]);
        let json = filter.to_qdrant();
        assert_eq!(json["must"][0]["match"]["any"][1], "internal");
    }

    #[test]
    fn test_negations_land_in_must_not() {
        let filter = Filter::new()
            .ne("language", "en")
            .not_within("tier", vec![json!("restricted")]);
        let json = filter.to_qdrant();
        assert!(json.get("must").is_none());
        assert_eq!(json["must_not"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_conjunction_of_mixed_conditions() {
        let filter = Filter::new()
            .eq("document_id", "UU_6_2011")
            .ne("tier", "restricted");
        let json = filter.to_qdrant();
        assert_eq!(json["must"].as_array().unwrap().len(), 1);
        assert_eq!(json["must_not"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_filter_is_empty_object() {
        assert_eq!(Filter::new().to_qdrant(), json!({}));
    }
}
