use serde::{Deserialize, Serialize};

use crate::serde_util::nullable_list;

/// A driving condition reference. The recorder never interprets these, it only
/// carries them between the entry form and the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Id(i64),
    Named { id: i64, name: String },
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub weather: Option<Condition>,
    #[serde(default, deserialize_with = "nullable_list::deserialize")]
    pub hazards: Vec<Condition>,
    #[serde(default, deserialize_with = "nullable_list::deserialize")]
    pub maneuvers: Vec<Condition>,
    #[serde(default, deserialize_with = "nullable_list::deserialize")]
    pub parkings: Vec<Condition>,
    #[serde(default, deserialize_with = "nullable_list::deserialize")]
    pub roadtypes: Vec<Condition>,
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.weather.is_none()
            && self.hazards.is_empty()
            && self.maneuvers.is_empty()
            && self.parkings.is_empty()
            && self.roadtypes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_ids_and_named_conditions_through() {
        let raw = r#"{"weather":{"id":2,"name":"Rain"},"hazards":[1,3],"maneuvers":null,"roadtypes":["4"]}"#;
        let conditions: Conditions = serde_json::from_str(raw).unwrap();

        assert_eq!(conditions.weather, Some(Condition::Named { id: 2, name: "Rain".into() }));
        assert_eq!(conditions.hazards, vec![Condition::Id(1), Condition::Id(3)]);
        assert!(conditions.maneuvers.is_empty());
        assert!(conditions.parkings.is_empty());
        assert_eq!(conditions.roadtypes, vec![Condition::Text("4".into())]);

        let back = serde_json::to_value(&conditions).unwrap();
        assert_eq!(back["weather"]["name"], "Rain");
        assert_eq!(back["hazards"][1], 3);
    }
}
