// ABOUTME: Integration tests for record reassembly and payload conversion
// ABOUTME: Drives MessageBag and Marshaler the way the listener does, without a backend

use change_notifier::config::{Culture, IdentityConversionPolicy, TextEncoding};
use change_notifier::error::NotifierError;
use change_notifier::marshal::{encode_text, ColumnType, Dialect, Marshaler};
use change_notifier::model::{assemble, ColumnDescriptor, ModelMapper, Property, Value, ValueKind};
use change_notifier::protocol::{BagStatus, ChangeKind, ClosedRecord, MessageBag, NamingConvention};
use chrono::{FixedOffset, Local, NaiveDate, NaiveTime, TimeZone};
use rust_decimal::Decimal;
use std::str::FromStr;

const PROPERTIES: &[Property] = &[
    Property::identity("id", ValueKind::I32),
    Property::new("name", ValueKind::String),
    Property::new("balance", ValueKind::Decimal),
    Property::new("active", ValueKind::Bool),
    Property::new("signed_up", ValueKind::Date),
];

fn naming() -> NamingConvention {
    NamingConvention::new("cn_customers_0badcafe")
}

fn columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "integer", 1),
        ColumnDescriptor::new("name", "character varying", 2),
        ColumnDescriptor::new("balance", "numeric", 3),
        ColumnDescriptor::new("active", "boolean", 4),
        ColumnDescriptor::new("signed_up", "date", 5),
    ]
}

fn pg() -> Marshaler {
    Marshaler::new(Dialect::POSTGRES, TextEncoding::Utf8, Culture::invariant())
}

/// Build the envelope sequence a trigger would emit for one change.
fn cycle(
    naming: &NamingConvention,
    kind: ChangeKind,
    values: &[(&str, Option<&str>)],
) -> Vec<(String, Option<Vec<u8>>)> {
    let mut envelopes = vec![(
        naming.start_signature(),
        Some(kind.as_str().as_bytes().to_vec()),
    )];
    for (column, value) in values {
        envelopes.push((
            naming.column_tag(kind, column),
            value.map(|v| v.as_bytes().to_vec()),
        ));
    }
    envelopes.push((
        naming.end_signature(),
        Some(kind.as_str().as_bytes().to_vec()),
    ));
    envelopes
}

/// Feed envelopes and collect closed records and faults in arrival order.
fn feed(
    bag: &mut MessageBag,
    envelopes: &[(String, Option<Vec<u8>>)],
) -> (Vec<ClosedRecord>, Vec<NotifierError>) {
    let mut records = Vec::new();
    let mut faults = Vec::new();
    for (tag, payload) in envelopes {
        match bag.add_message(tag, payload.as_deref()) {
            Ok(BagStatus::Closed) => records.extend(bag.take_closed()),
            Ok(_) => {}
            Err(err) => faults.push(err),
        }
    }
    (records, faults)
}

const ROW: &[(&str, Option<&str>)] = &[
    ("id", Some("7")),
    ("name", Some("Ada")),
    ("balance", Some("1250.50")),
    ("active", Some("1")),
    ("signed_up", Some("2024-02-29")),
];

#[test]
fn test_full_cycle_converts_into_record() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
    let (records, faults) = feed(&mut bag, &cycle(&naming, ChangeKind::Insert, ROW));
    assert!(faults.is_empty());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ChangeKind::Insert);
    assert_eq!(records[0].raw_kind, "Insert");

    let mapper = ModelMapper::new(PROPERTIES);
    let bindings = mapper
        .bind("public.customers", &columns(), &Dialect::POSTGRES)
        .unwrap();
    let assembled = assemble(
        &bindings,
        &records[0],
        &pg(),
        IdentityConversionPolicy::Abort,
    )
    .unwrap();
    assert!(assembled.faults.is_empty());

    let record = assembled.record;
    assert_eq!(record.require::<i32>("id").unwrap(), 7);
    assert_eq!(record.get::<String>("name").unwrap().as_deref(), Some("Ada"));
    assert_eq!(
        record.require::<Decimal>("balance").unwrap(),
        Decimal::from_str("1250.50").unwrap()
    );
    assert!(record.require::<bool>("active").unwrap());
    assert_eq!(
        record.require::<NaiveDate>("signed_up").unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
    );
}

#[test]
fn test_column_order_does_not_matter() {
    let naming = naming();
    let mut forward = MessageBag::new(&naming, TextEncoding::Utf8);
    let (expected, _) = feed(&mut forward, &cycle(&naming, ChangeKind::Update, ROW));

    let mut reversed_row = ROW.to_vec();
    reversed_row.reverse();
    let mut rotated_row = ROW.to_vec();
    rotated_row.rotate_left(2);

    for row in [reversed_row, rotated_row] {
        let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
        let (records, faults) = feed(&mut bag, &cycle(&naming, ChangeKind::Update, &row));
        assert!(faults.is_empty());
        assert_eq!(records, expected);
    }
}

#[test]
fn test_bag_is_reusable_across_cycles() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
    let mut envelopes = cycle(&naming, ChangeKind::Insert, ROW);
    envelopes.extend(cycle(&naming, ChangeKind::Delete, &[("id", Some("7"))]));
    envelopes.extend(cycle(&naming, ChangeKind::Insert, ROW));

    let (records, faults) = feed(&mut bag, &envelopes);
    assert!(faults.is_empty());
    let kinds: Vec<ChangeKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Insert, ChangeKind::Delete, ChangeKind::Insert]
    );
    assert_eq!(records[0], records[2]);
    assert_eq!(records[1].len(), 1);
}

#[test]
fn test_mismatched_end_drops_record_and_next_cycle_recovers() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);

    let mut envelopes = cycle(&naming, ChangeKind::Insert, ROW);
    let last = envelopes.len() - 1;
    envelopes[last].1 = Some(b"Delete".to_vec());
    envelopes.extend(cycle(&naming, ChangeKind::Update, ROW));

    let (records, faults) = feed(&mut bag, &envelopes);
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        &faults[0],
        NotifierError::DataMisaligned { end: ChangeKind::Delete, .. }
    ));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ChangeKind::Update);
}

#[test]
fn test_restart_mid_stream_discards_partial_record() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);

    // Transport dropped the tail of the first cycle
    let mut envelopes = cycle(&naming, ChangeKind::Insert, ROW);
    envelopes.truncate(3);
    envelopes.extend(cycle(&naming, ChangeKind::Insert, &[("id", Some("8"))]));

    let (records, faults) = feed(&mut bag, &envelopes);
    assert!(faults.is_empty());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].len(), 1);
    assert_eq!(records[0].payload("id"), Some(&b"8"[..]));
    assert!(!records[0].contains("name"));
}

#[test]
fn test_restart_with_new_kind_discards_previous_columns() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);

    let envelopes = vec![
        (naming.start_signature(), Some(b"Insert".to_vec())),
        (naming.column_tag(ChangeKind::Insert, "id"), Some(b"1".to_vec())),
        (naming.start_signature(), Some(b"Update".to_vec())),
        (naming.column_tag(ChangeKind::Update, "name"), Some(b"Grace".to_vec())),
        (naming.end_signature(), Some(b"Update".to_vec())),
    ];

    let (records, faults) = feed(&mut bag, &envelopes);
    assert!(faults.is_empty());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ChangeKind::Update);
    assert_eq!(records[0].raw_kind, "Update");
    assert_eq!(records[0].len(), 1);
    assert_eq!(records[0].payload("name"), Some(&b"Grace"[..]));
    assert!(!records[0].contains("id"));
}

#[test]
fn test_column_of_other_kind_is_misaligned() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
    let mut envelopes = cycle(&naming, ChangeKind::Insert, &[("id", Some("1"))]);
    envelopes.insert(
        2,
        (naming.column_tag(ChangeKind::Delete, "name"), Some(b"x".to_vec())),
    );

    envelopes.extend(cycle(&naming, ChangeKind::Insert, &[("id", Some("2"))]));

    let (records, faults) = feed(&mut bag, &envelopes);
    // One fault for the whole corrupt record; its end sentinel is skipped
    assert_eq!(faults.len(), 1);
    assert!(matches!(faults[0], NotifierError::MessageMisaligned { .. }));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload("id"), Some(&b"2"[..]));
}

#[test]
fn test_identity_policy_decides_bad_identity_fate() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
    let row = [("id", Some("seven")), ("name", Some("Ada"))];
    let (records, _) = feed(&mut bag, &cycle(&naming, ChangeKind::Insert, &row));

    let bindings = ModelMapper::new(PROPERTIES)
        .bind("public.customers", &columns(), &Dialect::POSTGRES)
        .unwrap();

    let err = assemble(&bindings, &records[0], &pg(), IdentityConversionPolicy::Abort)
        .unwrap_err();
    assert!(matches!(err, NotifierError::Conversion { ref property, .. } if property == "id"));

    let assembled = assemble(
        &bindings,
        &records[0],
        &pg(),
        IdentityConversionPolicy::NullFill,
    )
    .unwrap();
    assert_eq!(assembled.faults.len(), 1);
    assert_eq!(assembled.record.get::<i32>("id").unwrap(), None);
    assert_eq!(
        assembled.record.get::<String>("name").unwrap().as_deref(),
        Some("Ada")
    );
    // Columns that never arrived are null, not faults
    assert_eq!(assembled.record.value("balance"), None);
}

#[test]
fn test_latin1_payloads_decode() {
    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Latin1);
    let name = encode_text("Zoë", TextEncoding::Latin1).unwrap();
    assert_eq!(name.len(), 3);

    let envelopes = vec![
        (naming.start_signature(), Some(b"Insert".to_vec())),
        (naming.column_tag(ChangeKind::Insert, "name"), Some(name)),
        (naming.end_signature(), Some(b"Insert".to_vec())),
    ];
    let (records, _) = feed(&mut bag, &envelopes);

    let marshaler = Marshaler::new(Dialect::POSTGRES, TextEncoding::Latin1, Culture::invariant());
    let value = marshaler
        .convert(records[0].payload("name"), "text", ValueKind::String)
        .unwrap();
    assert_eq!(value, Some(Value::String("Zoë".to_string())));
}

#[test]
fn test_encode_then_convert_per_column_type() {
    let m = pg();
    let tz = FixedOffset::east_opt(2 * 3600).unwrap();
    let cases = vec![
        (Value::Bool(true), ColumnType::Boolean),
        (Value::I16(-12), ColumnType::SmallInt),
        (Value::I32(-2_147_483_648), ColumnType::Integer),
        (Value::I64(9_007_199_254_740_993), ColumnType::BigInt),
        (Value::Decimal(Decimal::from_str("-0.000123").unwrap()), ColumnType::Decimal),
        (Value::F32(-0.75), ColumnType::Real),
        (Value::F64(2.5), ColumnType::Double),
        (Value::String("line\nbreak".into()), ColumnType::Text),
        (Value::Bytes(vec![0, 1, 254, 255]), ColumnType::Binary),
        (
            Value::Time(NaiveTime::from_hms_micro_opt(7, 5, 9, 250_000).unwrap()),
            ColumnType::Time,
        ),
        (
            Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            ColumnType::Date,
        ),
        (
            Value::DateTime(
                NaiveDate::from_ymd_opt(2023, 12, 31)
                    .unwrap()
                    .and_hms_micro_opt(23, 59, 58, 123_456)
                    .unwrap(),
            ),
            ColumnType::Timestamp,
        ),
        (
            Value::DateTimeTz(tz.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()),
            ColumnType::TimestampTz,
        ),
        (
            Value::Uuid(uuid::Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)),
            ColumnType::Uuid,
        ),
    ];

    for (value, column_type) in cases {
        let wire = m.encode(&value, column_type).unwrap();
        let back = m
            .convert_column(Some(&wire), column_type, value.kind())
            .unwrap();
        assert_eq!(back, Some(value), "column type {}", column_type);
    }
}

#[test]
fn test_local_zone_timestamps_use_their_own_format() {
    let m = Marshaler::new(Dialect::ORACLE, TextEncoding::Utf8, Culture::invariant());
    let naive = NaiveDate::from_ymd_opt(2024, 1, 15)
        .unwrap()
        .and_hms_micro_opt(12, 30, 45, 500_000)
        .unwrap();
    let local = Local.from_local_datetime(&naive).earliest().unwrap();

    let wire = m
        .encode(&Value::DateTimeLocal(local), ColumnType::TimestampLocalTz)
        .unwrap();
    assert_eq!(wire, b"2024-01-15 12:30:45.500".to_vec());
    assert_eq!(
        m.convert(
            Some(&wire),
            "timestamp with local time zone",
            ValueKind::DateTimeLocal
        )
        .unwrap(),
        Some(Value::DateTimeLocal(local))
    );
    assert_eq!(
        m.convert(Some(&wire), "TIMESTAMP(6) WITH LOCAL TIME ZONE", ValueKind::DateTime)
            .unwrap(),
        Some(Value::DateTime(naive))
    );
    // A zone-less payload is no zoned timestamp
    assert!(m
        .convert(Some(&wire), "timestamp with local time zone", ValueKind::DateTimeTz)
        .is_err());
}

#[test]
fn test_character_array_targets() {
    const CODES: &[Property] = &[
        Property::identity("id", ValueKind::I32),
        Property::new("code", ValueKind::Chars),
    ];
    let columns = vec![
        ColumnDescriptor::new("id", "integer", 1),
        ColumnDescriptor::new("code", "character(3)", 2),
    ];
    let bindings = ModelMapper::new(CODES)
        .bind("public.codes", &columns, &Dialect::POSTGRES)
        .unwrap();

    let naming = naming();
    let mut bag = MessageBag::new(&naming, TextEncoding::Utf8);
    let (records, _) = feed(
        &mut bag,
        &cycle(&naming, ChangeKind::Insert, &[("id", Some("1")), ("code", Some("Zoë"))]),
    );
    let assembled = assemble(&bindings, &records[0], &pg(), IdentityConversionPolicy::Abort)
        .unwrap();
    assert!(assembled.faults.is_empty());
    assert_eq!(
        assembled.record.require::<Vec<char>>("code").unwrap(),
        vec!['Z', 'o', 'ë']
    );
    assert_eq!(
        assembled.record.get::<String>("code").unwrap().as_deref(),
        Some("Zoë")
    );

    assert_eq!(
        pg().convert(Some(b""), "char", ValueKind::Chars).unwrap(),
        None
    );
}

#[test]
fn test_culture_aware_numbers() {
    let culture = Culture {
        decimal_separator: ',',
        group_separator: Some('.'),
    };
    let m = Marshaler::new(Dialect::SQL_SERVER, TextEncoding::Utf8, culture);
    assert_eq!(
        m.convert(Some(b"1.234,5"), "decimal", ValueKind::Decimal).unwrap(),
        Some(Value::Decimal(Decimal::from_str("1234.5").unwrap()))
    );
    assert!(m.convert(Some(b"abc"), "int", ValueKind::I32).is_err());
}

#[test]
fn test_culture_numbers_from_postgres_trigger_rendering() {
    // The trigger swaps the decimal point for the culture's separator
    let culture = Culture {
        decimal_separator: ',',
        group_separator: Some('.'),
    };
    let m = Marshaler::new(Dialect::POSTGRES, TextEncoding::Utf8, culture);
    assert_eq!(
        m.convert(Some(b"1234,5"), "numeric", ValueKind::Decimal).unwrap(),
        Some(Value::Decimal(Decimal::from_str("1234.5").unwrap()))
    );
    assert_eq!(
        m.convert(Some(b"-0,125"), "double precision", ValueKind::F64).unwrap(),
        Some(Value::F64(-0.125))
    );
    assert_eq!(
        m.convert(Some(b"1,5e+20"), "float8", ValueKind::F64).unwrap(),
        Some(Value::F64(1.5e20))
    );
}
