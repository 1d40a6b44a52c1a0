use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults() {
    let c = UniverseConfig::default();
    assert_eq!(c.path, PathBuf::from("universe.db"));
    assert!(c.sync);
    assert_eq!(c.file_hosted_threshold, 65536);
    assert_eq!(c.global_order, UcnOrder::Descending);
    assert!(!c.repair_torn_tail);
    assert!(!c.read_only);
    assert!(!c.default_indexing);
}

#[test]
fn empty_environment_gives_defaults() {
    assert_eq!(UniverseConfig::from_lookup(|_| None), UniverseConfig::default());
}

#[test]
fn overrides_are_applied() {
    let c = UniverseConfig::from_lookup(lookup_from(&[
        (ENV_PATH, "/tmp/store.db"),
        (ENV_SYNC, "false"),
        (ENV_HOSTED_THRESHOLD, "0"),
        (ENV_GLOBAL_ORDER, "asc"),
        (ENV_REPAIR_TORN_TAIL, "true"),
        (ENV_READ_ONLY, "true"),
        (ENV_DEFAULT_INDEXING, " true "),
    ]));
    assert_eq!(c.path, PathBuf::from("/tmp/store.db"));
    assert!(!c.sync);
    assert_eq!(c.file_hosted_threshold, 0);
    assert_eq!(c.global_order, UcnOrder::Ascending);
    assert!(c.repair_torn_tail);
    assert!(c.read_only);
    assert!(c.default_indexing);
}

#[test]
fn unparseable_values_fall_back() {
    let c = UniverseConfig::from_lookup(lookup_from(&[
        (ENV_SYNC, "yes please"),
        (ENV_HOSTED_THRESHOLD, "-5"),
        (ENV_GLOBAL_ORDER, "sideways"),
    ]));
    assert!(c.sync);
    assert_eq!(c.file_hosted_threshold, DEFAULT_HOSTED_THRESHOLD);
    assert_eq!(c.global_order, UcnOrder::Descending);
}

#[test]
fn ucn_order_parses_and_displays() {
    assert_eq!("DESC".parse::<UcnOrder>(), Ok(UcnOrder::Descending));
    assert_eq!("ascending".parse::<UcnOrder>(), Ok(UcnOrder::Ascending));
    assert!("up".parse::<UcnOrder>().is_err());
    assert_eq!(UcnOrder::Ascending.to_string(), "asc");
}

#[test]
fn with_path_keeps_other_defaults() {
    let c = UniverseConfig::with_path("x.db");
    assert_eq!(c.path, PathBuf::from("x.db"));
    assert_eq!(c.file_hosted_threshold, DEFAULT_HOSTED_THRESHOLD);
}
