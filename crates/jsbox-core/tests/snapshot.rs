use jsbox_core::{Error, HostValue, Isolate, IsolateConfig, Snapshot};

const PRELUDE: &str = r#"
var prelude = { version: 3 };
function greet(name) { return `hello ${name}`; }
"#;

fn value(isolate: &Isolate, source: &str) -> HostValue {
    let context = isolate.create_context().expect("context");
    context
        .eval(source)
        .expect("eval")
        .into_value()
        .unwrap_or_else(|| panic!("expected success for {source:?}"))
}

fn with_snapshot(snapshot: Snapshot) -> Isolate {
    let config = IsolateConfig { snapshot: Some(snapshot), ..IsolateConfig::default() };
    Isolate::new(config).expect("isolate")
}

#[test]
fn contexts_start_with_snapshot_globals() {
    let snapshot = Snapshot::create(PRELUDE).expect("snapshot");
    assert!(!snapshot.is_empty());

    let isolate = with_snapshot(snapshot);
    assert_eq!(value(&isolate, "prelude.version"), HostValue::Integer(3));
    assert_eq!(value(&isolate, "greet('sandbox')"), HostValue::from("hello sandbox"));

    // Every context gets a fresh copy of the snapshot state.
    let first = isolate.create_context().expect("context");
    first.eval("prelude.version = 99").expect("eval");
    assert_eq!(value(&isolate, "prelude.version"), HostValue::Integer(3));
}

#[test]
fn isolates_without_snapshot_have_plain_globals() {
    let isolate = Isolate::new(IsolateConfig::default()).expect("isolate");
    assert_eq!(value(&isolate, "typeof prelude"), HostValue::from("undefined"));
}

#[test]
fn serialised_snapshots_load_back() {
    let snapshot = Snapshot::create(PRELUDE).expect("snapshot");
    let bytes = snapshot.to_bytes();
    let restored = Snapshot::from_bytes(&bytes).expect("from_bytes");
    assert_eq!(restored, snapshot);
    assert_eq!(restored.len(), snapshot.len());

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("prelude.snap");
    std::fs::write(&path, &bytes).expect("write");
    let loaded = Snapshot::from_bytes(&std::fs::read(&path).expect("read")).expect("from_bytes");

    let isolate = with_snapshot(loaded);
    assert_eq!(value(&isolate, "greet('disk')"), HostValue::from("hello disk"));
}

#[test]
fn malformed_snapshot_bytes_are_rejected() {
    let snapshot = Snapshot::create("var x = 1").expect("snapshot");
    let mut bytes = snapshot.to_bytes();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    assert!(matches!(Snapshot::from_bytes(&bytes), Err(Error::EngineInit(_))));
    assert!(matches!(Snapshot::from_bytes(b"JSBXSNAP"), Err(Error::EngineInit(_))));
}

#[test]
fn warm_up_compiles_without_leaking_globals() {
    let snapshot =
        Snapshot::create_warmed(PRELUDE, "var warmed = greet('warm');").expect("snapshot");
    let isolate = with_snapshot(snapshot);
    assert_eq!(value(&isolate, "typeof warmed"), HostValue::from("undefined"));
    assert_eq!(value(&isolate, "greet('again')"), HostValue::from("hello again"));
}

#[test]
fn failing_setup_scripts_are_engine_init_errors() {
    match Snapshot::create("throw new Error('setup broke')") {
        Err(Error::EngineInit(message)) => assert!(message.contains("setup broke"), "{message}"),
        other => panic!("expected engine init error, got {other:?}"),
    }
    assert!(matches!(Snapshot::create("function ("), Err(Error::EngineInit(_))));
    assert!(matches!(
        Snapshot::create_warmed("var ok = 1", "missing()"),
        Err(Error::EngineInit(message)) if message.contains("warm-up")
    ));
}
