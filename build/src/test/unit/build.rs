use std::fs;

use crate::test::{entries, kernels_dir, require_clang, write};
use crate::{BuildConfig, Error, ErrorKind, Toolchain, build_library};

#[test]
fn test_missing_toolchain_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    let output_dir = root.path().join("out");
    let config = BuildConfig::new(kernels_dir(), &output_dir)
        .with_toolchain(Toolchain::Clang { compiler: "forge-definitely-not-a-compiler".to_string() });

    let error = build_library(&config).unwrap_err();
    assert!(matches!(error, Error::MissingToolchain { .. }));
    assert!(!output_dir.exists(), "output directory must not be created");
}

#[test]
fn test_missing_source_dir() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let config = BuildConfig::new(root.path().join("nope"), root.path().join("out"));

    let error = build_library(&config).unwrap_err();
    assert!(matches!(error, Error::SourceDirMissing { .. }));
    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert!(!root.path().join("out").exists());
}

#[test]
fn test_empty_source_dir() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    fs::create_dir(&src).unwrap();
    write(&src, "README.txt", "not a kernel");

    let error = build_library(&BuildConfig::new(&src, root.path().join("out"))).unwrap_err();
    assert!(matches!(&error, Error::NoSources { extension, .. } if extension == "c"));
    assert_eq!(error.kind(), ErrorKind::Configuration);
}

#[test]
fn test_output_dir_is_a_file() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let output = root.path().join("out");
    fs::write(&output, b"occupied").unwrap();

    let error = build_library(&BuildConfig::new(kernels_dir(), &output)).unwrap_err();
    assert!(matches!(error, Error::OutputDir { .. }));
}

#[test]
fn test_build_kernels() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let output_dir = root.path().join("nested").join("out");

    let output = build_library(&BuildConfig::new(kernels_dir(), &output_dir)).unwrap();
    assert_eq!(output.library, output_dir.join("default.so"));
    assert!(output.library.is_file());
    assert_eq!(output.embedded, None);
    assert_eq!(output.sources.len(), 1);
    assert_eq!(entries(&output_dir), vec!["default.so"], "intermediates must be removed");
}

#[test]
fn test_sources_compile_in_sorted_order() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    fs::create_dir(&src).unwrap();
    write(&src, "b.c", "int second(void) { return 2; }\n");
    write(&src, "a.c", "int first(void) { return 1; }\n");

    let output = build_library(&BuildConfig::new(&src, root.path().join("out")).with_library_name("ops")).unwrap();
    let names: Vec<_> = output.sources.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
    assert_eq!(names, vec!["a.c", "b.c"]);
    assert!(output.library.ends_with("ops.so"));
}

#[test]
fn test_compile_error_names_file_and_leaves_nothing() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let out = root.path().join("out");
    fs::create_dir(&src).unwrap();
    write(&src, "a_good.c", "int good(void) { return 0; }\n");
    write(&src, "b_bad.c", "int bad(void) { return undeclared_symbol; }\n");

    let error = build_library(&BuildConfig::new(&src, &out)).unwrap_err();
    match &error {
        Error::Compile { file, diagnostic } => {
            assert!(file.ends_with("b_bad.c"));
            assert!(diagnostic.contains("undeclared_symbol"), "diagnostic: {diagnostic}");
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert_eq!(error.kind(), ErrorKind::Compile);
    assert!(entries(&out).is_empty(), "no artifact or intermediates: {:?}", entries(&out));
}

#[test]
fn test_link_error_lists_inputs() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let src = root.path().join("src");
    let out = root.path().join("out");
    fs::create_dir(&src).unwrap();
    write(&src, "one.c", "int duplicate(void) { return 1; }\n");
    write(&src, "two.c", "int duplicate(void) { return 2; }\n");

    let error = build_library(&BuildConfig::new(&src, &out)).unwrap_err();
    match &error {
        Error::Link { inputs, .. } => {
            assert_eq!(inputs.len(), 2);
            assert!(inputs[0].ends_with("one.c"));
            assert!(inputs[1].ends_with("two.c"));
        }
        other => panic!("expected link error, got {other:?}"),
    }
    assert_eq!(error.kind(), ErrorKind::Link);
    assert!(entries(&out).is_empty());
}

#[test]
fn test_emit_rust_embedding() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");

    let output = build_library(&BuildConfig::new(kernels_dir(), &out).with_emit_rust(true)).unwrap();
    let embedded = output.embedded.unwrap();
    assert_eq!(embedded, out.join("default_library.rs"));

    let text = fs::read_to_string(&embedded).unwrap();
    assert!(text.contains("pub static KERNEL_LIBRARY: &[u8] = &["));
    let library_len = fs::metadata(&output.library).unwrap().len() as usize;
    assert_eq!(text.matches("0x").count(), library_len);
}

#[test]
fn test_rebuild_replaces_artifact() {
    require_clang!();
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let config = BuildConfig::new(kernels_dir(), &out);

    let first = build_library(&config).unwrap();
    let second = build_library(&config).unwrap();
    assert_eq!(first.library, second.library);
    assert_eq!(entries(&out), vec!["default.so"]);
}
