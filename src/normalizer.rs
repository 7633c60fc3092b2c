use crate::connectors::{RawResult, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub valid: bool,
    pub value: f64,
    pub reason: Option<String>,
}

impl Normalized {
    pub fn valid(value: f64) -> Self {
        Self {
            valid: true,
            value,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            value: 0.0,
            reason: Some(reason.into()),
        }
    }
}

pub fn normalize(raw: &RawResult) -> Normalized {
    match raw {
        RawResult::Scalar(value) => coerce(value),
        RawResult::Rows(rows) => {
            let Some(first) = rows.first() else {
                return Normalized::invalid("query returned no rows");
            };
            match pick_field(first) {
                Some(value) => coerce(value),
                None => Normalized::invalid("first row has no fields"),
            }
        }
    }
}

fn pick_field(row: &Row) -> Option<&serde_json::Value> {
    row.fields
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("value"))
        .or_else(|| row.fields.first())
        .map(|(_, value)| value)
}

fn coerce(value: &serde_json::Value) -> Normalized {
    let parsed = match value {
        serde_json::Value::Null => return Normalized::invalid("value is null"),
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => {
            let cleaned = text
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect::<String>();
            cleaned.parse::<f64>().ok()
        }
        other => {
            return Normalized::invalid(format!("unsupported value type: {}", json_type_name(other)));
        }
    };

    match parsed {
        Some(number) if number.is_finite() => Normalized::valid(number),
        Some(_) => Normalized::invalid("value is not finite"),
        None => Normalized::invalid(format!("value is not numeric: {}", value)),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::normalize;
    use crate::connectors::{RawResult, Row};
    use serde_json::json;

    fn single_row(row: Row) -> RawResult {
        RawResult::Rows(vec![row])
    }

    #[test]
    fn strips_formatting_from_string_values() {
        let outcome = normalize(&single_row(Row::new().with_field("value", json!("1,234.5"))));
        assert!(outcome.valid);
        assert_eq!(outcome.value, 1234.5);

        let outcome = normalize(&single_row(Row::new().with_field("value", json!("$ -12"))));
        assert!(outcome.valid);
        assert_eq!(outcome.value, -12.0);
    }

    #[test]
    fn falls_back_to_first_field_without_a_value_column() {
        let outcome = normalize(&single_row(
            Row::new().with_field("count", json!(7)).with_field("other", json!(99)),
        ));
        assert!(outcome.valid);
        assert_eq!(outcome.value, 7.0);
    }

    #[test]
    fn prefers_value_column_case_insensitively() {
        let outcome = normalize(&single_row(
            Row::new().with_field("label", json!("north")).with_field("VALUE", json!(3)),
        ));
        assert!(outcome.valid);
        assert_eq!(outcome.value, 3.0);
    }

    #[test]
    fn only_the_first_row_counts() {
        let outcome = normalize(&RawResult::Rows(vec![
            Row::new().with_field("value", json!(1)),
            Row::new().with_field("value", json!(2)),
        ]));
        assert_eq!(outcome.value, 1.0);
    }

    #[test]
    fn rejects_null_unparsable_and_empty_results() {
        assert!(!normalize(&single_row(Row::new().with_field("value", json!(null)))).valid);
        assert!(!normalize(&single_row(Row::new().with_field("value", json!("n/a")))).valid);
        assert!(!normalize(&single_row(Row::new().with_field("value", json!("1.2.3")))).valid);
        assert!(!normalize(&single_row(Row::new().with_field("value", json!(true)))).valid);
        assert!(!normalize(&single_row(Row::new())).valid);
        assert!(!normalize(&RawResult::Rows(Vec::new())).valid);
    }

    #[test]
    fn validates_bare_scalars() {
        let outcome = normalize(&RawResult::Scalar(json!(42)));
        assert!(outcome.valid);
        assert_eq!(outcome.value, 42.0);
        assert!(!normalize(&RawResult::Scalar(json!(null))).valid);
        assert!(outcome.reason.is_none());
    }
}
