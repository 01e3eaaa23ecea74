use keepass_core::crypto::engine::TWOFISH_UUID;
use keepass_core::crypto::kdf::aes;
use keepass_core::format::{self, detect_generation};
use keepass_core::tree::{Entry, FormatGeneration};
use keepass_core::{Database, DatabaseError, EngineContext, MasterCredential, OpenOptions, SaveOptions};

fn legacy_database() -> Database {
    let mut db = Database::new_legacy();
    db.crypto.kdf = aes::parameters(6);
    let root = db.root_id();
    let group = db.add_group(&root, db.new_group("Root")).unwrap();
    let mut entry = Entry::new();
    entry.set_title("Example");
    entry.set_username("user");
    entry.set_password("pass");
    db.add_entry(&group, entry).unwrap();
    db
}

#[test]
fn legacy_file_opens_only_with_the_right_password() {
    let ctx = EngineContext::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.kdb");
    let credential = MasterCredential::password("legacy-pw");
    format::save_to_path(&legacy_database(), &path, &credential, &SaveOptions::default(), &ctx).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(detect_generation(&bytes).unwrap(), FormatGeneration::Legacy);

    let db = format::open_path(&path, &credential, &OpenOptions::default(), &ctx).unwrap();
    assert!(db.is_legacy());
    let group = db.child_groups(&db.root_id()).next().unwrap();
    assert_eq!(group.title, "Root");
    let entry = db.child_entries(&group.id).next().unwrap();
    assert_eq!(entry.title(), "Example");
    assert_eq!(entry.username(), "user");
    assert_eq!(entry.password(), "pass");

    let wrong = format::open_path(&path, &MasterCredential::password("nope"), &OpenOptions::default(), &ctx);
    assert!(matches!(wrong, Err(DatabaseError::InvalidCredentials)));
}

#[test]
fn legacy_twofish_with_key_file() {
    let ctx = EngineContext::default();
    let credential = MasterCredential::password("pw").with_key_file(b"plain text key file".to_vec());
    let options = SaveOptions::new().cipher(TWOFISH_UUID);
    let bytes = format::encode(&legacy_database(), &credential, &options, &ctx).unwrap();

    let db = format::open(&bytes, &credential, &OpenOptions::default(), &ctx).unwrap();
    assert_eq!(db.crypto.cipher, TWOFISH_UUID);
    assert_eq!(db.entry_count(), 1);

    let password_only = format::open(&bytes, &MasterCredential::password("pw"), &OpenOptions::default(), &ctx);
    assert!(matches!(password_only, Err(DatabaseError::InvalidCredentials)));
}

#[test]
fn legacy_save_rejects_entries_in_the_hidden_root() {
    let ctx = EngineContext::default();
    let mut db = legacy_database();
    let root = db.root_id();
    db.add_entry(&root, Entry::new()).unwrap();
    let result = format::encode(&db, &MasterCredential::password("pw"), &SaveOptions::default(), &ctx);
    assert!(matches!(result, Err(DatabaseError::MalformedDocument(_))));
}
