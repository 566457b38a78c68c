//! Application to helper round trips over an in-process socket pair.

use std::{
    os::unix::net::UnixStream,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use umbra_client::{
    AccessLedger, BridgeConfig, CryptoService, ErrorKind, FileSystemProvider, MemoryBlobStore,
    RandomSource, SecureBytes, SecurityBridge, SecurityService, ServiceContainer, SocketProxy,
};
use umbra_helper::{serve_connection, RequestHandler};

fn connect(handler: &RequestHandler) -> (SecurityBridge, JoinHandle<()>) {
    let (client_side, helper_side) = UnixStream::pair().unwrap();
    let handler = handler.clone();
    let helper = thread::spawn(move || {
        serve_connection(&handler, helper_side).unwrap();
    });
    let proxy = SocketProxy::from_stream(client_side);
    let config = BridgeConfig::new().with_operation_timeout(Duration::from_secs(5));
    (SecurityBridge::new(Arc::new(proxy), config), helper)
}

#[tokio::test]
async fn test_encrypt_decrypt_through_helper() {
    let handler = RequestHandler::default();
    let (bridge, helper) = connect(&handler);

    bridge.ping().await.unwrap();
    let key = bridge.generate_key("symmetric", Some("repo")).await.unwrap();
    assert_eq!(key, "repo");

    let plain = SecureBytes::from("backup password");
    let sealed = bridge.encrypt(&plain, &key).await.unwrap();
    assert_eq!(sealed.len(), 24 + plain.len() + 16);
    assert_ne!(&sealed.as_bytes()[24..24 + plain.len()], plain.as_bytes());

    let opened = bridge.decrypt(&sealed, &key).await.unwrap();
    assert_eq!(opened, plain);

    drop(bridge);
    helper.join().unwrap();
}

#[tokio::test]
async fn test_sign_and_verify_through_helper() {
    let handler = RequestHandler::default();
    let (bridge, helper) = connect(&handler);

    let key = bridge.generate_key("signing", None).await.unwrap();
    let data = SecureBytes::from("snapshot manifest");
    let signature = bridge.sign(&data, &key).await.unwrap();
    assert_eq!(signature.len(), 64);

    assert!(bridge.verify(&data, signature.as_bytes(), &key).await.unwrap());

    let mut tampered = signature.as_bytes().to_vec();
    tampered[0] ^= 0xff;
    assert!(!bridge.verify(&data, &tampered, &key).await.unwrap());

    let public = bridge.export_key(&key, true).await.unwrap();
    assert_eq!(public.len(), 32);

    drop(bridge);
    helper.join().unwrap();
}

#[tokio::test]
async fn test_key_management_through_helper() {
    let handler = RequestHandler::default();
    let (bridge, helper) = connect(&handler);

    bridge.generate_key("symmetric", Some("a")).await.unwrap();
    bridge
        .import_key(&SecureBytes::new(vec![7u8; 32]), "symmetric", "b")
        .await
        .unwrap();

    let mut ids = bridge.list_key_identifiers().await.unwrap();
    ids.sort();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

    let raw = bridge.export_key("b", false).await.unwrap();
    assert_eq!(raw.as_bytes(), &[7u8; 32]);

    bridge.delete_key("a").await.unwrap();
    let err = bridge.encrypt(&SecureBytes::from("x"), "a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::KeyNotFound);
    assert_eq!(bridge.list_key_identifiers().await.unwrap(), vec!["b".to_string()]);

    drop(bridge);
    helper.join().unwrap();
}

#[tokio::test]
async fn test_random_bytes_come_from_helper() {
    let handler = RequestHandler::default();
    let (bridge, helper) = connect(&handler);

    let random = bridge.generate_random_bytes(48).await.unwrap();
    assert_eq!(random.bytes.len(), 48);
    assert_eq!(random.source, RandomSource::Remote);
    let again = bridge.generate_random_bytes(48).await.unwrap();
    assert_ne!(random.bytes, again.bytes);

    let digest = bridge.hash(&SecureBytes::from("abc"), None).await.unwrap();
    assert_eq!(
        hex::encode(digest.as_bytes()),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    drop(bridge);
    helper.join().unwrap();
}

#[tokio::test]
async fn test_random_bytes_fall_back_when_helper_is_gone() {
    let (client_side, helper_side) = UnixStream::pair().unwrap();
    drop(helper_side);
    let bridge = SecurityBridge::new(
        Arc::new(SocketProxy::from_stream(client_side)),
        BridgeConfig::new().with_operation_timeout(Duration::from_secs(5)),
    );

    let random = bridge.generate_random_bytes(16).await.unwrap();
    assert_eq!(random.bytes.len(), 16);
    assert_eq!(random.source, RandomSource::Local);
}

#[tokio::test]
async fn test_services_share_one_helper_connection() {
    let handler = RequestHandler::default();
    let helpers = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let dir = tempfile::tempdir().unwrap();

    let container = ServiceContainer::new();
    {
        let handler = handler.clone();
        let helpers = helpers.clone();
        container.register(move || {
            let (bridge, helper) = connect(&handler);
            helpers.lock().push(helper);
            Ok(CryptoService::new(bridge))
        });
    }
    let root = dir.path().to_path_buf();
    container.register(move || {
        Ok(AccessLedger::new(
            Arc::new(FileSystemProvider::new().with_allowed_root(root.clone())),
            Arc::new(MemoryBlobStore::new()),
        ))
    });
    container.register(|| Ok(SecurityService::new(Arc::new(MemoryBlobStore::new()))));

    let crypto = container.resolve::<CryptoService>().await.unwrap();
    crypto.generate_key("symmetric", Some("credentials")).await.unwrap();

    let security = container.resolve::<SecurityService>().await.unwrap();
    let secret = SecureBytes::from("hunter2");
    security
        .store_credential("main", &secret, "credentials")
        .await
        .unwrap();
    assert_eq!(security.load_credential("main", "credentials").await.unwrap(), secret);
    assert_eq!(handler.keys().len(), 1);

    drop(crypto);
    drop(security);
    container.shutdown_all().await.unwrap();

    let helpers = std::mem::take(&mut *helpers.lock());
    assert_eq!(helpers.len(), 1);
    for helper in helpers {
        helper.join().unwrap();
    }
}
