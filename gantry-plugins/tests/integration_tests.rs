//! Integration tests for the file-backed loader plugins

use gantry_plugins::{JsonFilePlugin, TextFilePlugin};
use gantry_modules::{
    ConfigurationOptions, DetectedEnvironment, Exports, LoaderError, ModuleFactory, ModuleManager,
    NullEventRecorder, StaticResourceLoader,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use tempfile::TempDir;

fn engine_rooted_at(dir: &TempDir) -> ModuleManager {
    let manager = ModuleManager::new(
        Rc::new(DetectedEnvironment),
        Rc::new(StaticResourceLoader::new()),
        Rc::new(NullEventRecorder),
    );
    manager.configure(
        ConfigurationOptions {
            base_location: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        },
        false,
    );
    manager
}

#[test]
fn test_text_plugin_delivers_file_contents() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("greeting.txt"), "hello, loader").unwrap();

    let manager = engine_rooted_at(&dir);
    manager
        .define_module(
            "text",
            &[],
            ModuleFactory::from_fn(|_| Ok(Some(Exports::plugin(Rc::new(TextFilePlugin))))),
            None,
        )
        .unwrap();

    let got = Rc::new(RefCell::new(Value::Null));
    let slot = got.clone();
    manager
        .define_module(
            "consumer",
            &["text!greeting.txt"],
            ModuleFactory::from_fn(move |values| {
                *slot.borrow_mut() = values[0].to_value();
                Ok(None)
            }),
            None,
        )
        .unwrap();
    assert_eq!(*got.borrow(), json!("hello, loader"));
}

#[test]
fn test_json_plugin_parses_and_memoizes() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("settings.json"),
        r#"{"retries": 3, "verbose": false}"#,
    )
    .unwrap();

    let manager = engine_rooted_at(&dir);
    manager
        .define_module(
            "json",
            &[],
            ModuleFactory::from_fn(|_| Ok(Some(Exports::plugin(Rc::new(JsonFilePlugin))))),
            None,
        )
        .unwrap();

    let got = Rc::new(RefCell::new(Value::Null));
    let slot = got.clone();
    manager
        .define_module(
            "consumer",
            &["json!settings.json"],
            ModuleFactory::from_fn(move |values| {
                *slot.borrow_mut() = values[0].to_value();
                Ok(None)
            }),
            None,
        )
        .unwrap();
    assert_eq!(*got.borrow(), json!({"retries": 3, "verbose": false}));
    assert_eq!(
        manager
            .synchronous_require("json!settings.json")
            .unwrap()
            .to_value(),
        json!({"retries": 3, "verbose": false})
    );
}

#[test]
fn test_missing_file_fails_the_mediated_dependency() {
    let dir = TempDir::new().unwrap();
    let manager = engine_rooted_at(&dir);
    manager
        .define_module(
            "text",
            &[],
            ModuleFactory::from_fn(|_| Ok(Some(Exports::plugin(Rc::new(TextFilePlugin))))),
            None,
        )
        .unwrap();

    let handled = Rc::new(RefCell::new(None::<LoaderError>));
    let sink = handled.clone();
    manager
        .define_module(
            "consumer",
            &["text!missing.txt"],
            ModuleFactory::from_fn(|_| panic!("consumer must not complete")),
            Some(Box::new(move |error| {
                *sink.borrow_mut() = Some(error.clone());
            })),
        )
        .unwrap();

    let error = handled.borrow().clone().expect("handler invoked");
    assert!(matches!(error, LoaderError::LoadFailed { .. }));
    assert_eq!(error.module(), Some("text!missing.txt"));
}

#[test]
fn test_json_parse_error_reports_the_resource() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.json"), "{not json").unwrap();

    let manager = engine_rooted_at(&dir);
    manager
        .define_module(
            "json",
            &[],
            ModuleFactory::from_fn(|_| Ok(Some(Exports::plugin(Rc::new(JsonFilePlugin))))),
            None,
        )
        .unwrap();

    let handled = Rc::new(RefCell::new(None::<LoaderError>));
    let sink = handled.clone();
    manager
        .define_module(
            "consumer",
            &["json!broken.json"],
            ModuleFactory::from_fn(|_| panic!("consumer must not complete")),
            Some(Box::new(move |error| {
                *sink.borrow_mut() = Some(error.clone());
            })),
        )
        .unwrap();

    let handled_error = handled.borrow().clone().expect("handler invoked");
    match handled_error {
        LoaderError::LoadFailed { reason, .. } => assert!(reason.contains("broken.json")),
        other => panic!("expected a loading error, got {other:?}"),
    }
}
