use std::fs;
use std::path::Path;

#[test]
fn lib_root_exports_only_domain_modules() {
    let lib_rs = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/lib.rs");
    let source = fs::read_to_string(&lib_rs).expect("read src/lib.rs");
    let modules: Vec<&str> = source
        .lines()
        .filter_map(|line| line.strip_prefix("pub mod "))
        .map(|line| line.trim_end_matches(';'))
        .collect();

    assert_eq!(
        modules,
        vec!["app", "config", "intent", "orchestration", "queue", "runtime", "shared"]
    );
}

#[test]
fn binary_routes_through_the_app_module() {
    let bin = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/bin/runbridge.rs");
    let source = fs::read_to_string(&bin).expect("read src/bin/runbridge.rs");
    assert!(source.contains("app::run_cli"));
    assert!(source.contains("EnvFilter"));
    assert!(source.lines().all(|line| line.chars().count() <= 100));
}
