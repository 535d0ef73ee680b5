mod helpers;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use labforge::secrets::input::PresetInput;
use labforge::secrets::schema::SECRET_GROUPS;
use labforge::secrets::{SecretError, SecretSeeder};

use helpers::{MockStore, StaticKeys};

fn full_answers() -> HashMap<String, String> {
    let mut answers = HashMap::new();
    answers.insert("NetBox admin password".to_string(), "nb-pass".to_string());
    answers.insert("AWX admin password".to_string(), "awx-pass".to_string());
    answers.insert(
        "SSH key passphrase (empty for none)".to_string(),
        String::new(),
    );
    answers.insert("NetBox hostname".to_string(), "netbox.example.net".to_string());
    answers
}

fn seeder(answers: HashMap<String, String>) -> SecretSeeder {
    SecretSeeder::new(
        Arc::new(PresetInput::new(answers, true)),
        Arc::new(StaticKeys::new("---fake ed25519 key---")),
    )
}

#[tokio::test]
async fn test_all_groups_are_written() {
    let store = MockStore::new();
    let report = seeder(full_answers())
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap();

    assert_eq!(report.records, SECRET_GROUPS.len());
    for group in SECRET_GROUPS {
        assert!(store.record(group.path).is_some(), "missing {}", group.path);
    }

    let netbox = store.record("netbox/admin").unwrap();
    let token = netbox
        .iter()
        .find(|(k, _)| k == "api_token")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(token.len(), 40);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    let ssh = store.record("awx/ssh").unwrap();
    let key = ssh.iter().find(|(k, _)| k == "private_key").unwrap();
    assert_eq!(key.1, "---fake ed25519 key---");
    assert!(report.key_generated);
}

#[tokio::test]
async fn test_non_confidential_answers_become_variables() {
    let store = MockStore::new();
    let report = seeder(full_answers())
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap();

    assert_eq!(
        report.variables.get("netbox_host").map(String::as_str),
        Some("netbox.example.net")
    );
    // Defaults flow through for unanswered prompts
    assert_eq!(
        report.variables.get("awx_host").map(String::as_str),
        Some("awx.lab.local")
    );
    assert_eq!(
        report.variables.get("git_branch").map(String::as_str),
        Some("main")
    );
    // Passwords never appear as variables
    assert!(!report.variables.values().any(|v| v == "nb-pass"));
}

#[tokio::test]
async fn test_reseeding_overwrites_without_duplicates() {
    let store = MockStore::new();
    seeder(full_answers())
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap();

    let mut answers = full_answers();
    answers.insert("AWX admin password".to_string(), "rotated".to_string());
    seeder(answers)
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap();

    assert_eq!(store.record_count(), SECRET_GROUPS.len());
    let awx = store.record("awx/admin").unwrap();
    let password = awx.iter().find(|(k, _)| k == "password").unwrap();
    assert_eq!(password.1, "rotated");
}

#[tokio::test]
async fn test_unhealthy_store_refuses_to_seed() {
    let store = MockStore::unhealthy();
    let err = seeder(full_answers())
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap_err();

    assert!(matches!(err, SecretError::StoreUnreachable(_)));
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_missing_answer_aborts_before_any_write() {
    let mut answers = full_answers();
    // awx/admin is the second group; its password going unanswered must
    // leave even the first group unwritten
    answers.remove("AWX admin password");

    let store = MockStore::new();
    let err = seeder(answers)
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap_err();

    assert!(matches!(err, SecretError::MissingInput { .. }));
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_write_failure_names_the_group() {
    let store = MockStore::new().failing_on("awx/ssh");
    let err = seeder(full_answers())
        .seed(&store, Path::new("/nonexistent/labforge-test-key"))
        .await
        .unwrap_err();

    match err {
        SecretError::WriteFailed { path, .. } => assert_eq!(path, "awx/ssh"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_existing_ssh_key_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("id_ed25519");
    std::fs::write(&key_path, "---preexisting key---").unwrap();

    let store = MockStore::new();
    let report = seeder(full_answers()).seed(&store, &key_path).await.unwrap();

    assert!(!report.key_generated);
    let ssh = store.record("awx/ssh").unwrap();
    let key = ssh.iter().find(|(k, _)| k == "private_key").unwrap();
    assert_eq!(key.1, "---preexisting key---");
}
