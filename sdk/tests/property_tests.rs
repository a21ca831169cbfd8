use proptest::prelude::*;
use sdk::errors::{EngineError, VitalisErrorExt};
use sdk::types::{PressureEvent, ThermalLevel};

// User hints must always be present and must never echo the wrapped
// message, which can carry health data or local paths.
proptest! {
    #[test]
    fn test_error_user_hint_never_echoes_message(detail in "[a-z]{12,40}") {
        let errs = vec![
            EngineError::Config(detail.clone()),
            EngineError::Platform(detail.clone()),
            EngineError::DataSource(detail.clone()),
            EngineError::InvalidState(detail.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&detail));
            prop_assert!(err.to_string().contains(&detail));
        }
    }
}

proptest! {
    #[test]
    fn test_thermal_level_parse_is_case_insensitive(
        level in prop_oneof![
            Just(ThermalLevel::Nominal),
            Just(ThermalLevel::Fair),
            Just(ThermalLevel::Serious),
            Just(ThermalLevel::Critical),
        ],
        upper in any::<bool>(),
    ) {
        let text = if upper {
            level.to_string().to_uppercase()
        } else {
            level.to_string()
        };
        prop_assert_eq!(text.parse::<ThermalLevel>(), Ok(level));
    }
}

#[test]
fn test_pressure_event_wire_format() {
    let json = serde_json::to_string(&PressureEvent::ThermalLevel(ThermalLevel::Serious)).unwrap();
    assert_eq!(json, r#"{"type":"thermal_level","level":"serious"}"#);

    let json = serde_json::to_string(&PressureEvent::MemoryWarning).unwrap();
    assert_eq!(json, r#"{"type":"memory_warning"}"#);
}
