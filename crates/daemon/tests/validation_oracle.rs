//! Validation oracle (property 6) against the exact folder-set scenario
//! from the manager's contract (scenario S5: add a strict ancestor of two
//! already-managed folders and see both named in the warning).

use std::sync::Arc;

use folderd::manager::FolderManager;
use folderd::model_registry::ModelRegistry;
use folderd_core::config::FolderConfig;
use folderd_core::error::ValidationCode;

fn cfg(path: &std::path::Path) -> FolderConfig {
    FolderConfig { path: path.to_path_buf(), model: "minilm".to_string(), ignore: vec![], extensions: vec![] }
}

// start_folder spawns a watch task on the tokio handle, so this needs a
// running runtime even though nothing here awaits.
#[tokio::test]
async fn managed_set_ab_rejects_subfolder_and_duplicate_warns_on_ancestor() {
    let root = tempfile::tempdir().unwrap();
    let a = root.path().join("a");
    let b = a.join("b");
    std::fs::create_dir_all(&b).unwrap();

    let manager = FolderManager::new(Arc::new(ModelRegistry::new(3)));
    manager.start_folder(&cfg(&a), 3).unwrap();
    manager.start_folder(&cfg(&b), 3).unwrap();

    // Adding a/b again: it's an exact match for an existing entry, but it's
    // also a strict subfolder of `a`; the descendant relationship wins.
    let result = manager.validate(&b);
    assert!(!result.valid);
    assert_eq!(result.errors[0].code, ValidationCode::Subfolder);

    // Adding `a` again is an exact duplicate.
    let result = manager.validate(&a);
    assert!(!result.valid);
    assert_eq!(result.errors[0].code, ValidationCode::Duplicate);

    // Adding the common parent is valid, but warns that it strictly
    // contains both already-managed folders.
    let result = manager.validate(root.path());
    assert!(result.valid);
    assert!(result.errors.is_empty());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].code, ValidationCode::Ancestor);
    let mut affected = result.warnings[0].affected.clone();
    affected.sort();
    let mut expected = vec![folderd_core::path::normalize(&a), folderd_core::path::normalize(&b)];
    expected.sort();
    assert_eq!(affected, expected);

    // A path that doesn't exist at all is rejected before any managed-set
    // comparison happens.
    let missing = root.path().join("does-not-exist");
    let result = manager.validate(&missing);
    assert!(!result.valid);
    assert_eq!(result.errors[0].code, ValidationCode::NotExists);
}
