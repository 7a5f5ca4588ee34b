#[cfg(feature = "serde")]
mod serde_tests {
    use molten::{SyntaxError, SyntaxErrorKind, UndefinedBehavior};

    #[test]
    fn undefined_behavior_round_trips() {
        let behavior = UndefinedBehavior::Strict;
        let serialized = serde_json::to_string(&behavior).unwrap();
        assert_eq!(serialized, r#""Strict""#);

        let deserialized: UndefinedBehavior = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, behavior);
    }

    #[test]
    fn syntax_errors_round_trip() {
        let err = SyntaxError::new(
            4,
            SyntaxErrorKind::UnknownTag {
                name: "endwhile".to_string(),
            },
        );
        let serialized = serde_json::to_string(&err).unwrap();
        let deserialized: SyntaxError = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, err);
        assert_eq!(deserialized.line, 4);
    }

    #[test]
    fn syntax_error_kind_serializes_by_variant_name() {
        let kind = SyntaxErrorKind::UnterminatedString;
        let serialized = serde_json::to_string(&kind).unwrap();
        assert_eq!(serialized, r#""UnterminatedString""#);
    }
}
