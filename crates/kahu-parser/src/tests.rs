use chrono::{NaiveDate, NaiveDateTime};

use crate::coerce::{apply_transforms, CoercionSettings, RejectCategory, TypedValue};
use crate::errors::FilenameError;
use crate::extract::{ExtractType, FullLoadRule};
use crate::filename::parse_object_key;
use crate::framer::Framer;
use crate::schema::{handler_for, validate_registry, TargetType, ValidationRule};

const PATIENTS_KEY: &str = "685146545Patients202508180544202508190544202508190854.csv";

fn frame_all(content: &[u8], chunk_size: usize) -> Vec<Vec<String>> {
    let mut framer = Framer::new();
    let mut rows = Vec::new();
    for chunk in content.chunks(chunk_size.max(1)) {
        framer.push(chunk, &mut rows).expect("push");
    }
    if let Some(last) = framer.finish().expect("finish") {
        rows.push(last);
    }
    rows
}

#[test]
fn parses_patients_filename() {
    let parsed = parse_object_key(PATIENTS_KEY, FullLoadRule::SnapshotWindow).expect("parse");

    assert_eq!(parsed.per_org_id, "68514");
    assert_eq!(parsed.practice_id, "6545");
    assert_eq!(parsed.extract_type, ExtractType::Patients);
    assert_eq!(
        parsed.date_from,
        NaiveDate::from_ymd_opt(2025, 8, 18)
            .unwrap()
            .and_hms_opt(5, 44, 0)
            .unwrap()
    );
    assert_eq!(parsed.batch_id, "2508190854");
    assert!(!parsed.is_full_load);
}

#[test]
fn filename_round_trips() {
    let parsed = parse_object_key(PATIENTS_KEY, FullLoadRule::SnapshotWindow).expect("parse");
    assert_eq!(parsed.format_name(), PATIENTS_KEY);
}

#[test]
fn filename_round_trips_singular_variant() {
    let key = "123459876Immunisation202501010000202501020000202501021530.csv";
    let parsed = parse_object_key(key, FullLoadRule::SnapshotWindow).expect("parse");
    assert_eq!(parsed.extract_type, ExtractType::Immunisations);
    assert_eq!(parsed.type_token, "Immunisation");
    assert_eq!(parsed.format_name(), key);
}

#[test]
fn strips_directory_prefix() {
    let key = format!("incoming/2025/08/{PATIENTS_KEY}");
    let parsed = parse_object_key(&key, FullLoadRule::SnapshotWindow).expect("parse");
    assert_eq!(parsed.extract_type, ExtractType::Patients);
    assert_eq!(parsed.format_name(), PATIENTS_KEY);
}

#[test]
fn rejects_malformed_names() {
    assert!(matches!(
        parse_object_key("685146545Patients.txt", FullLoadRule::Never),
        Err(FilenameError::NotCsv(_))
    ));
    assert!(matches!(
        parse_object_key("68514Patients2025.csv", FullLoadRule::Never),
        Err(FilenameError::TooShort { .. })
    ));
    assert!(matches!(
        parse_object_key(
            "685146545Widgets202508180544202508190544202508190854.csv",
            FullLoadRule::Never
        ),
        Err(FilenameError::UnknownExtractType { .. })
    ));
    assert!(matches!(
        parse_object_key(
            "685146545Patients202508990544202508990544202508990854.csv",
            FullLoadRule::Never
        ),
        Err(FilenameError::InvalidDate { .. })
    ));
    // date_to before date_from
    assert!(matches!(
        parse_object_key(
            "685146545Patients202508190544202508180544202508190854.csv",
            FullLoadRule::Never
        ),
        Err(FilenameError::DatesOutOfOrder { .. })
    ));
}

#[test]
fn snapshot_window_marks_full_load() {
    let key = "685146545Patients202508190544202508190544202508190854.csv";
    let parsed = parse_object_key(key, FullLoadRule::SnapshotWindow).expect("parse");
    assert!(parsed.is_full_load);

    let parsed = parse_object_key(key, FullLoadRule::Never).expect("parse");
    assert!(!parsed.is_full_load);
}

#[test]
fn frames_rows_and_fields() {
    let content = b"1|~~|alice|~~|x|^^|2|~~|bob|~~|y|^^|";
    let rows = frame_all(content, content.len());
    assert_eq!(
        rows,
        vec![
            vec!["1".to_string(), "alice".to_string(), "x".to_string()],
            vec!["2".to_string(), "bob".to_string(), "y".to_string()],
        ]
    );
}

#[test]
fn framing_is_chunk_size_invariant() {
    let content = b"1|~~|alice|~~||^^|2|~~|bob|~~|term|^^|3|~~||~~||^^|";
    let expected = frame_all(content, content.len());
    assert_eq!(expected.len(), 3);

    for chunk_size in 1..=content.len() {
        assert_eq!(
            frame_all(content, chunk_size),
            expected,
            "chunk size {chunk_size} changed framing"
        );
    }
}

#[test]
fn preserves_empty_trailing_fields() {
    let rows = frame_all(b"a|~~||~~||^^|", 3);
    assert_eq!(rows, vec![vec!["a".to_string(), String::new(), String::new()]]);
}

#[test]
fn final_row_without_terminator_is_emitted() {
    let rows = frame_all(b"1|~~|alice|^^|2|~~|bob", 4);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], vec!["2".to_string(), "bob".to_string()]);
}

#[test]
fn empty_input_yields_no_rows() {
    assert!(frame_all(b"", 8).is_empty());
}

#[test]
fn registry_is_consistent() {
    validate_registry().expect("registry valid");
    for extract in ExtractType::ALL {
        let handler = handler_for(extract);
        assert_eq!(handler.extract_type, extract);
        assert!(handler.landing_table.starts_with("raw."));
        assert!(handler.staging_table.starts_with("stg."));
        assert_eq!(handler.natural_keys.len(), 3);
    }
}

fn patient_values() -> Vec<Option<String>> {
    let values = [
        "42",
        "ZZZ0016",
        "6545",
        "68514",
        "Mere",
        "Ngata",
        "1985-03-02",
        "F",
        "mere.ngata@example.org",
        "0210000000",
        "12 High St",
        "Newtown",
        "Wellington",
        "6021",
        "2019-07-01",
        "false",
        "2025-08-19 05:44:00",
    ];
    values.iter().map(|v| Some((*v).to_string())).collect()
}

#[test]
fn transforms_accept_well_formed_patient_row() {
    let handler = handler_for(ExtractType::Patients);
    let typed = apply_transforms(handler, &patient_values(), &CoercionSettings::default())
        .expect("row accepted");

    assert_eq!(typed.len(), handler.transforms.len());
    assert_eq!(typed[0], TypedValue::Integer(42));
    assert_eq!(typed[1], TypedValue::Text("ZZZ0016".to_string()));
    assert!(matches!(typed[6], TypedValue::Date(_)));
    assert_eq!(typed[15], TypedValue::Boolean(false));
    assert!(matches!(typed[16], TypedValue::Timestamp(_)));
}

#[test]
fn missing_required_column_rejects_row() {
    let handler = handler_for(ExtractType::Patients);
    let mut values = patient_values();
    values[2] = Some("   ".to_string()); // practice_id trims then nullifies

    let errors = apply_transforms(handler, &values, &CoercionSettings::default()).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].column, "practice_id");
    assert_eq!(errors[0].category, RejectCategory::MissingRequired);
}

#[test]
fn invalid_nhi_rejects_with_validation_category() {
    let handler = handler_for(ExtractType::Patients);
    let mut values = patient_values();
    values[1] = Some("AIO1234".to_string()); // I and O are never issued

    let errors = apply_transforms(handler, &values, &CoercionSettings::default()).unwrap_err();
    assert_eq!(errors[0].category, RejectCategory::Validation);
    assert_eq!(errors[0].column, "nhi_number");
}

#[test]
fn new_format_nhi_is_accepted() {
    let rule = ValidationRule::Nhi;
    assert!(rule.check(&TypedValue::Text("ZVB16AC".to_string())).is_ok());
    assert!(rule.check(&TypedValue::Text("ZZZ0016".to_string())).is_ok());
    assert!(rule.check(&TypedValue::Text("zzz0016".to_string())).is_err());
}

#[test]
fn unparseable_date_rejects_with_coercion_category() {
    let handler = handler_for(ExtractType::Patients);
    let mut values = patient_values();
    values[6] = Some("02/03/1985".to_string());

    let errors = apply_transforms(handler, &values, &CoercionSettings::default()).unwrap_err();
    assert_eq!(errors[0].category, RejectCategory::TypeCoercion);
    assert_eq!(errors[0].column, "date_of_birth");
}

#[test]
fn one_row_collects_multiple_field_errors() {
    let handler = handler_for(ExtractType::Patients);
    let mut values = patient_values();
    values[0] = Some("not-a-number".to_string());
    values[7] = Some("X".to_string());

    let errors = apply_transforms(handler, &values, &CoercionSettings::default()).unwrap_err();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].category, RejectCategory::TypeCoercion);
    assert_eq!(errors[1].category, RejectCategory::Validation);
}

#[test]
fn decimal_precision_is_enforced() {
    let settings = CoercionSettings::default();
    let coerced = crate::coerce::coerce_value("12.5000", TargetType::Decimal, &settings);
    assert_eq!(coerced, Ok(TypedValue::Decimal("12.5000".to_string())));

    assert!(crate::coerce::coerce_value("12.50001", TargetType::Decimal, &settings).is_err());
    assert!(crate::coerce::coerce_value("1.2.3", TargetType::Decimal, &settings).is_err());
    assert_eq!(
        crate::coerce::coerce_value("+7", TargetType::Decimal, &settings),
        Ok(TypedValue::Decimal("7".to_string()))
    );
}

#[test]
fn empty_strings_stay_empty_when_nullify_disabled() {
    let handler = handler_for(ExtractType::Patients);
    let mut settings = CoercionSettings::default();
    settings.nullify_empty_strings = false;

    let mut values = patient_values();
    values[4] = Some(String::new()); // first_name, optional text

    let typed = apply_transforms(handler, &values, &settings).expect("accepted");
    assert_eq!(typed[4], TypedValue::Text(String::new()));
}

#[test]
fn timestamps_resolve_in_the_ingestion_zone() {
    let settings = CoercionSettings::default();
    let value =
        crate::coerce::coerce_value("2025-08-19 05:44:00", TargetType::Timestamp, &settings)
            .expect("timestamp");

    // NZST is UTC+12 in August.
    let TypedValue::Timestamp(instant) = value else {
        panic!("expected timestamp");
    };
    let expected: NaiveDateTime = NaiveDate::from_ymd_opt(2025, 8, 18)
        .unwrap()
        .and_hms_opt(17, 44, 0)
        .unwrap();
    assert_eq!(instant.naive_utc(), expected);
}
