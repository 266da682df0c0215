//! Serde adapters that keep non-finite costs intact.
//!
//! JSON has no representation for infinity, and rejected configurations are
//! scored `+inf`. Finite values stay plain numbers; non-finite values are
//! written as the strings `"inf"`, `"-inf"` and `"nan"`.
//!
//! ```ignore
//! #[serde(with = "ct_types::float_serde")]
//! cost: f64,
//! ```

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Num(f64),
    Text(String),
}

fn to_repr(value: f64) -> Repr {
    if value.is_finite() {
        Repr::Num(value)
    } else if value.is_nan() {
        Repr::Text("nan".to_string())
    } else if value > 0.0 {
        Repr::Text("inf".to_string())
    } else {
        Repr::Text("-inf".to_string())
    }
}

fn from_repr<E: de::Error>(repr: Repr) -> Result<f64, E> {
    match repr {
        Repr::Num(value) => Ok(value),
        Repr::Text(text) => match text.as_str() {
            "inf" | "+inf" | "Infinity" => Ok(f64::INFINITY),
            "-inf" | "-Infinity" => Ok(f64::NEG_INFINITY),
            "nan" | "NaN" => Ok(f64::NAN),
            other => Err(E::custom(format!("invalid float literal {other:?}"))),
        },
    }
}

pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    to_repr(*value).serialize(serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    from_repr(Repr::deserialize(deserializer)?)
}

/// For `Option<f64>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(to_repr).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<Repr>::deserialize(deserializer)?
            .map(from_repr)
            .transpose()
    }
}

/// For `Vec<f64>` fields.
pub mod vec {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| to_repr(*v))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(from_repr)
            .collect()
    }
}

/// For `Vec<Option<f64>>` fields.
pub mod option_vec {
    use super::*;

    pub fn serialize<S: Serializer>(
        values: &[Option<f64>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| v.map(to_repr))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Option<f64>>, D::Error> {
        Vec::<Option<Repr>>::deserialize(deserializer)?
            .into_iter()
            .map(|v| v.map(from_repr).transpose())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Costs {
        #[serde(with = "super")]
        cost: f64,
        #[serde(with = "super::option")]
        truedyn: Option<f64>,
        #[serde(with = "super::vec")]
        history: Vec<f64>,
        #[serde(with = "super::option_vec")]
        maybe: Vec<Option<f64>>,
    }

    #[test]
    fn infinite_costs_survive_json() {
        let costs = Costs {
            cost: f64::INFINITY,
            truedyn: Some(f64::NEG_INFINITY),
            history: vec![1.5, f64::INFINITY],
            maybe: vec![None, Some(f64::INFINITY), Some(2.0)],
        };
        let json = serde_json::to_string(&costs).unwrap();
        assert!(json.contains("\"inf\""));
        assert!(json.contains("1.5"));

        let back: Costs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, costs);
    }

    #[test]
    fn integers_and_garbage() {
        let parsed: Costs = serde_json::from_str(
            r#"{"cost": 3, "truedyn": null, "history": [], "maybe": []}"#,
        )
        .unwrap();
        assert_eq!(parsed.cost, 3.0);
        assert_eq!(parsed.truedyn, None);

        let bad = serde_json::from_str::<Costs>(
            r#"{"cost": "lots", "truedyn": null, "history": [], "maybe": []}"#,
        );
        assert!(bad.is_err());
    }
}
