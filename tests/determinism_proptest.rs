//! Property tests for the two determinism invariants a tiered classifier
//! must hold: the same headers always synthesize the same message identity,
//! and the same classifier input always returns the same verdict tuple.

use proptest::prelude::*;
use sentinel_mail::{ClassifierInput, ThreeTierClassifier};

fn arb_header_blob() -> impl Strategy<Value = Vec<u8>> {
    (
        "[a-z]{3,12}",
        "[a-z0-9-]{3,20}",
        "[a-zA-Z0-9 ,!?']{0,60}",
        1u32..28,
    )
        .prop_map(|(local, domain, subject, day)| {
            format!(
                "From: {local}@{domain}.example\r\nSubject: {subject}\r\nDate: {day:02} Nov 2025 10:00:00 +0000\r\n\r\n"
            )
            .into_bytes()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn identity_parse_is_deterministic(raw in arb_header_blob()) {
        let first = sentinel_mail::identity::parse_headers(&raw);
        let second = sentinel_mail::identity::parse_headers(&raw);
        prop_assert_eq!(first.message_id, second.message_id);
        prop_assert_eq!(first.sender_domain, second.sender_domain);
    }

    #[test]
    fn classifier_verdict_is_deterministic_for_fixed_input(raw in arb_header_blob()) {
        let identity = sentinel_mail::identity::parse_headers(&raw);
        let input = ClassifierInput::from(&identity);
        let classifier = ThreeTierClassifier::new(0.75, 0.6, 5, 0.0, Vec::new());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let first = runtime.block_on(classifier.classify("fixed-id", &input));
        let second = runtime.block_on(classifier.classify("fixed-id", &input));

        prop_assert_eq!(first.category, second.category);
        prop_assert_eq!(first.subcategory, second.subcategory);
        prop_assert_eq!(first.tier, second.tier);
        prop_assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
    }
}
