mod common;

use chrono::Utc;
use common::*;
use std::fs;
use tranche_core::net::memory::MemoryNetwork;
use tranche_core::topology::ServerInfo;
use tranche_core::ValidationError;

fn small_source(td: &tempfile::TempDir) -> std::path::PathBuf {
    let src = td.path().join("x.txt");
    fs::write(&src, b"x").unwrap();
    src
}

#[test]
fn missing_and_empty_sources() {
    let td = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::with_core_servers(2);

    let err = session(&net, config(&td.path().join("nope"))).execute().unwrap_err();
    assert!(matches!(err, ValidationError::MissingSource(_)));

    let empty = td.path().join("empty");
    fs::create_dir_all(empty.join("nested")).unwrap();
    let err = session(&net, config(&empty)).execute().unwrap_err();
    assert!(matches!(err, ValidationError::EmptySource(_)));

    fs::write(empty.join("nested/only.tmp"), b"t").unwrap();
    let mut cfg = config(&empty);
    cfg.exclude = vec!["**/*.tmp".into()];
    let err = session(&net, cfg).execute().unwrap_err();
    assert!(matches!(err, ValidationError::EmptySource(_)));

    let mut cfg = config(&empty);
    cfg.exclude = vec!["[".into()];
    assert!(matches!(session(&net, cfg).execute(), Err(ValidationError::BadPattern(_))));
    assert_eq!(net.total_put_calls(), 0);
}

#[test]
fn credentials_are_required_and_current() {
    let td = tempfile::tempdir().unwrap();
    let src = small_source(&td);
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&src);
    cfg.credentials = None;
    assert!(matches!(session(&net, cfg).execute(), Err(ValidationError::MissingCredentials)));

    let mut cfg = config(&src);
    let mut creds = credentials(3);
    creds.expires = Some(Utc::now() - chrono::Duration::minutes(5));
    cfg.credentials = Some(creds);
    assert!(matches!(session(&net, cfg).execute(), Err(ValidationError::ExpiredCredentials(_))));
}

#[test]
fn some_server_must_be_selected_and_usable() {
    let td = tempfile::tempdir().unwrap();
    let src = small_source(&td);

    let net = MemoryNetwork::with_core_servers(2);
    let mut cfg = config(&src);
    cfg.use_unspecified_servers = false;
    assert!(matches!(session(&net, cfg).execute(), Err(ValidationError::NoServersSelected)));

    // offline, read-only, non-core and unreachable servers do not count
    let net = MemoryNetwork::new();
    let mut offline = ServerInfo::core("offline");
    offline.online = false;
    net.add_server(offline);
    let mut readonly = ServerInfo::core("readonly");
    readonly.writable = false;
    net.add_server(readonly);
    let mut edge = ServerInfo::core("edge");
    edge.core = false;
    net.add_server(edge);
    net.add_server(ServerInfo::core("down")).set_unreachable(true);
    assert!(matches!(
        session(&net, config(&src)).execute(),
        Err(ValidationError::NoUsableServers)
    ));

    // an explicit selection that excludes the only usable server
    let net = MemoryNetwork::with_core_servers(1);
    let mut cfg = config(&src);
    cfg.use_unspecified_servers = false;
    cfg.servers = vec!["elsewhere".into()];
    assert!(matches!(session(&net, cfg).execute(), Err(ValidationError::NoUsableServers)));
}

#[test]
fn failed_validation_leaves_the_session_configurable() {
    let td = tempfile::tempdir().unwrap();
    let src = small_source(&td);
    let net = MemoryNetwork::with_core_servers(2);
    let mut cfg = config(&src);
    cfg.credentials = None;
    let s = session(&net, cfg);
    assert!(s.execute().is_err());
    assert!(!s.is_locked());
    s.configure(|c| c.credentials = Some(credentials(1))).unwrap();
    let report = s.execute().unwrap();
    assert!(report.hash.is_some(), "{:?}", report.failures);
    assert_eq!(report.title, "x.txt");
}
