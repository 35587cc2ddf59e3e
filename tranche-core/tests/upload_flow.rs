mod common;

use common::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tranche_core::archive::ArchiveExpander;
use tranche_core::encoding::padding_for;
use tranche_core::hash::ContentHash;
use tranche_core::model::DatasetManifest;
use tranche_core::net::memory::MemoryNetwork;
use tranche_core::net::ChunkKind;
use tranche_core::producer::MANIFEST_NAME;
use tranche_core::relay::RelayPlanner;
use tranche_core::topology::{HostId, ServerInfo};
use tranche_core::{ConfigError, Event, EventKind, ValidationError};

#[test]
fn single_file_is_chunked_and_replicated() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("big.bin");
    write_random_file(&src, 2 * (1 << 20) + (1 << 19), 1);
    let body = fs::read(&src).unwrap();
    let net = MemoryNetwork::with_core_servers(3);

    let report = session(&net, config(&src)).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let root = report.hash.unwrap();
    assert_eq!(root, ContentHash::of(&body));
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.title, "big.bin");

    let record = meta_record(&net, &root).unwrap();
    let entry = &record.uploaders[0];
    assert_eq!(entry.parts.len(), 3);
    assert!(entry.signature.verify(&root));
    assert_eq!(entry.properties.size, body.len() as u64);
    for part in &entry.parts {
        assert!(net.data_holders(part).len() >= 2);
    }
    assert!(net.meta_holders(&root).len() >= 2);
    assert_eq!(download(&net, &root, None), body);
}

#[test]
fn directory_upload_ends_with_the_manifest() {
    let td = tempfile::tempdir().unwrap();
    let dir = td.path().join("data");
    fs::create_dir_all(dir.join("sub")).unwrap();
    fs::write(dir.join("b.txt"), b"bravo").unwrap();
    fs::write(dir.join("a.txt"), b"alpha").unwrap();
    write_random_file(&dir.join("sub/c.bin"), 300_000, 2);
    let net = MemoryNetwork::with_core_servers(3);

    let mut cfg = config(&dir);
    cfg.passphrase = Some("secret".into());
    cfg.license = Some("CC-BY 4.0".into());
    cfg.title = "three files".into();
    let report = session(&net, cfg).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.encrypted);
    assert_eq!((report.files_uploaded, report.files_total), (3, 3));
    let root = report.hash.unwrap();

    // the manifest is the last metadata record to reach the network
    let metas: Vec<_> = net.store_log().into_iter().filter(|r| r.kind == ChunkKind::Meta).collect();
    let first_root = metas.iter().position(|r| r.hash == root).unwrap();
    assert!(metas[first_root..].iter().all(|r| r.hash == root));

    let padding = padding_for(Some("secret"));
    let mut stream = download(&net, &root, Some("secret"));
    assert!(stream.ends_with(&padding));
    stream.truncate(stream.len() - padding.len());
    let manifest = DatasetManifest::from_bytes(&stream).unwrap();
    let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["data/a.txt", "data/b.txt", "data/sub/c.bin"]);
    assert!(manifest.entries.iter().all(|e| e.padding == padding));

    let license = manifest.license.unwrap();
    let mut text = download(&net, &license, Some("secret"));
    text.truncate(text.len() - padding.len());
    assert_eq!(text, b"CC-BY 4.0");

    let a = &manifest.entries[0];
    let mut bytes = download(&net, &a.hash, Some("secret"));
    bytes.truncate(bytes.len() - padding.len());
    assert_eq!(bytes, b"alpha");

    let record = meta_record(&net, &root).unwrap();
    let names: Vec<&str> =
        record.uploaders[0].annotations.iter().map(|x| x.name.as_str()).collect();
    assert!(names.contains(&"Tranche:Title"));
    assert_eq!(record.uploaders[0].properties.dataset_path, MANIFEST_NAME);
}

#[test]
fn host_denying_its_chunks_is_tolerated() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("f.bin");
    write_random_file(&src, 200_000, 3);
    let net = MemoryNetwork::with_core_servers(3);
    net.server("core-1").unwrap().set_deny_has(true);

    let report = session(&net, config(&src)).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.hash.is_some());
}

#[test]
fn replication_factor_above_core_count_fails() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("f.bin");
    write_random_file(&src, 10_000, 4);
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&src);
    cfg.replication_factor = 3;
    let report = session(&net, cfg).execute().unwrap();
    assert!(report.hash.is_none());
    let replicas = |f: &tranche_core::report::Failure| f.message.contains("replicas");
    assert!(report.failures.iter().any(replicas), "{:?}", report.failures);
}

#[test]
fn stop_winds_down_every_pool() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("slow.bin");
    write_random_file(&src, 8 << 20, 5);
    let net = MemoryNetwork::with_core_servers(2);
    for h in net.hosts() {
        net.server(&h).unwrap().set_put_delay(Duration::from_millis(10));
    }
    let mut cfg = config(&src);
    cfg.chunk_size = 64 * 1024;
    let s = Arc::new(session(&net, cfg));

    let runner = {
        let s = s.clone();
        std::thread::spawn(move || s.execute())
    };
    std::thread::sleep(Duration::from_millis(150));
    s.stop();
    let report = runner.join().unwrap().unwrap();
    assert!(report.hash.is_none());
    assert!(report.failures.iter().any(|f| f.message.contains("stopped")));

    let puts = net.total_put_calls();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(net.total_put_calls(), puts);
}

#[test]
fn data_only_uploads_skip_metadata() {
    let td = tempfile::tempdir().unwrap();
    let dir = td.path().join("d");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("one.txt"), b"one").unwrap();
    fs::write(dir.join("two.txt"), b"two").unwrap();
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&dir);
    cfg.data_only = true;
    let report = session(&net, cfg).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.hash.is_some());
    assert_eq!(report.files_uploaded, 2);
    assert!(net.store_log().iter().all(|r| r.kind == ChunkKind::Data));
    assert!(net.data_holders(&ContentHash::of(b"one")).len() >= 2);
}

#[test]
fn archives_are_expanded_into_members() {
    let td = tempfile::tempdir().unwrap();
    let dir = td.path().join("logs");
    fs::create_dir(&dir).unwrap();
    let body = b"entry\n".repeat(5000);
    fs::write(dir.join("day.log.zst"), zstd::stream::encode_all(&body[..], 3).unwrap()).unwrap();
    fs::write(dir.join("plain.txt"), b"plain").unwrap();
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&dir);
    cfg.expand_archives = true;
    let report = session(&net, cfg).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!((report.files_uploaded, report.files_total), (2, 2));

    let stream = download(&net, &report.hash.unwrap(), None);
    let manifest = DatasetManifest::from_bytes(&stream).unwrap();
    let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["logs/day.log", "logs/plain.txt"]);
    assert_eq!(manifest.entries[0].hash, ContentHash::of(&body));
}

#[test]
fn excluded_and_empty_files() {
    let td = tempfile::tempdir().unwrap();
    let dir = td.path().join("d");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("keep.txt"), b"keep").unwrap();
    fs::write(dir.join("empty.txt"), b"").unwrap();
    fs::write(dir.join("scratch.tmp"), b"skip me").unwrap();
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&dir);
    cfg.exclude = vec!["*.tmp".into()];
    let report = session(&net, cfg).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.files_uploaded, 2);

    let empty = ContentHash::of(b"");
    let record = meta_record(&net, &empty).unwrap();
    assert!(record.uploaders[0].parts.is_empty());
    assert!(net.data_holders(&ContentHash::of(b"skip me")).is_empty());
}

#[test]
fn identical_uploads_are_deterministic_and_merge_uploaders() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("same.bin");
    write_random_file(&src, 150_000, 6);
    let net = MemoryNetwork::with_core_servers(3);

    let mut cfg = config(&src);
    cfg.passphrase = Some("pw".into());
    cfg.compress = true;
    let first = session(&net, cfg.clone()).execute().unwrap();
    let chunks_after_first = net.store_log().iter().filter(|r| r.kind == ChunkKind::Data).count();

    cfg.credentials = Some(credentials(9));
    let second = session(&net, cfg).execute().unwrap();
    assert_eq!(first.hash, second.hash);
    let root = second.hash.unwrap();

    let record = meta_record(&net, &root).unwrap();
    assert_eq!(record.uploaders.len(), 2);
    assert_eq!(record.uploaders[0].parts, record.uploaders[1].parts);
    assert_eq!(record.uploaders[0].encodings, record.uploaders[1].encodings);
    let chunks_now = net.store_log().iter().filter(|r| r.kind == ChunkKind::Data).count();
    assert!(chunks_now > chunks_after_first);
}

#[test]
fn sticky_servers_join_the_core_tier() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("s.txt");
    fs::write(&src, b"sticky data").unwrap();
    let net = MemoryNetwork::with_core_servers(2);
    let mut edge = ServerInfo::core("edge");
    edge.core = false;
    edge.spans.clear();
    net.add_server(edge);

    let mut cfg = config(&src);
    cfg.sticky_servers = vec!["edge".into()];
    let report = session(&net, cfg).execute().unwrap();
    let root = report.hash.unwrap();
    assert!(net.data_holders(&root).contains(&"edge".to_string()));
    let record = meta_record(&net, &root).unwrap();
    assert_eq!(record.uploaders[0].sticky_servers, vec!["edge".to_string()]);
}

#[test]
fn listeners_see_the_session_in_order() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("e.txt");
    fs::write(&src, b"events").unwrap();
    let net = MemoryNetwork::with_core_servers(2);
    let s = session(&net, config(&src));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    s.subscribe(Arc::new(move |e: &Event| -> anyhow::Result<()> {
        sink.lock().push(e.kind);
        Ok(())
    }));
    s.subscribe(Arc::new(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("flaky listener") }));

    let report = s.execute().unwrap();
    assert!(report.hash.is_some());
    let kinds = seen.lock().clone();
    assert_eq!(kinds.first(), Some(&EventKind::SessionStarted));
    assert_eq!(kinds.last(), Some(&EventKind::SessionFinished));
    let pos = |k| kinds.iter().position(|x| *x == k).unwrap();
    assert!(pos(EventKind::ChunkUploaded) < pos(EventKind::MetaUploaded));
    assert!(pos(EventKind::MetaUploaded) < pos(EventKind::FileFinished));
}

#[test]
fn session_locks_once_started() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("l.txt");
    fs::write(&src, b"lock").unwrap();
    let net = MemoryNetwork::with_core_servers(2);
    let s = session(&net, config(&src));
    s.configure(|c| c.description = "before".into()).unwrap();
    let report = s.execute().unwrap();
    assert_eq!(report.description, "before");
    assert!(s.is_locked());
    assert_eq!(s.configure(|c| c.description = "after".into()), Err(ConfigError::Locked));
    assert!(matches!(s.execute(), Err(ValidationError::AlreadyStarted)));
}

/// Sends every chunk through the lowest-named host only.
#[derive(Default)]
struct SingleRelay {
    plans: AtomicUsize,
}

impl RelayPlanner for SingleRelay {
    fn plan(&self, _hash: &ContentHash, connected: &[HostId]) -> Vec<HostId> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        connected.iter().min().cloned().into_iter().collect()
    }
}

#[test]
fn one_relay_fans_out_to_the_replication_factor() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("r.bin");
    write_random_file(&src, 400_000, 11);
    let net = MemoryNetwork::with_core_servers(3);
    let planner = Arc::new(SingleRelay::default());

    let mut cfg = config(&src);
    cfg.replication_factor = 3;
    cfg.chunk_size = 128 * 1024;
    let report = session(&net, cfg).with_planner(planner.clone()).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let root = report.hash.unwrap();

    let record = meta_record(&net, &root).unwrap();
    let parts = &record.uploaders[0].parts;
    assert_eq!(parts.len(), 4);
    assert!(planner.plans.load(Ordering::SeqCst) >= parts.len() + 1);
    for part in parts {
        assert_eq!(net.data_holders(part).len(), 3);
    }
    // the relay accepts each chunk before any peer does
    let mut first: BTreeMap<ContentHash, String> = BTreeMap::new();
    for r in net.store_log() {
        first.entry(r.hash).or_insert(r.host);
    }
    assert!(first.values().all(|h| h == "core-0"), "{:?}", first);
}

#[test]
fn one_relay_cannot_cover_a_refusing_peer() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("r.bin");
    write_random_file(&src, 20_000, 12);
    let net = MemoryNetwork::with_core_servers(3);
    net.server("core-2").unwrap().set_reject_puts(true);

    let mut cfg = config(&src);
    cfg.replication_factor = 3;
    let report = session(&net, cfg)
        .with_planner(Arc::new(SingleRelay::default()))
        .execute()
        .unwrap();
    assert!(report.hash.is_none());
    let replicas = |f: &tranche_core::report::Failure| f.message.contains("replicas");
    assert!(report.failures.iter().any(replicas), "{:?}", report.failures);
}

/// `.bundle` files hold one `name=content` member per line.
struct LineBundle;

impl ArchiveExpander for LineBundle {
    fn matches(&self, file_name: &str) -> bool {
        file_name.ends_with(".bundle")
    }

    fn expand(&self, archive: &Path, dest: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let text = fs::read_to_string(archive)?;
        let mut members = Vec::new();
        for line in text.lines() {
            let (name, body) = line.split_once('=').ok_or_else(|| anyhow::anyhow!("bad line"))?;
            let out = dest.join(name);
            if let Some(dir) = out.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&out, body)?;
            members.push(PathBuf::from(name));
        }
        Ok(members)
    }
}

#[test]
fn registered_expanders_unpack_their_containers() {
    let td = tempfile::tempdir().unwrap();
    let dir = td.path().join("pack");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("two.bundle"), "a.txt=first\ninner/b.txt=second\n").unwrap();
    fs::write(dir.join("x.txt"), b"loose").unwrap();
    let net = MemoryNetwork::with_core_servers(2);

    let mut cfg = config(&dir);
    cfg.expand_archives = true;
    let report = session(&net, cfg).with_expander(Arc::new(LineBundle)).execute().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!((report.files_uploaded, report.files_total), (3, 3));

    let stream = download(&net, &report.hash.unwrap(), None);
    let manifest = DatasetManifest::from_bytes(&stream).unwrap();
    let mut paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["pack/a.txt", "pack/inner/b.txt", "pack/x.txt"]);
    assert!(net.data_holders(&ContentHash::of(b"second")).len() >= 2);
    assert!(net.meta_holders(&ContentHash::of(b"a.txt=first\ninner/b.txt=second\n")).is_empty());
}

#[test]
fn paused_session_still_returns_its_report() {
    let td = tempfile::tempdir().unwrap();
    let src = td.path().join("p.txt");
    fs::write(&src, b"paused delivery").unwrap();
    let net = MemoryNetwork::with_core_servers(2);
    let s = Arc::new(session(&net, config(&src)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    s.subscribe(Arc::new(move |e: &Event| -> anyhow::Result<()> {
        sink.lock().push(e.kind);
        Ok(())
    }));
    s.pause();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let runner = s.clone();
    std::thread::spawn(move || {
        let _ = tx.send(runner.execute());
    });
    let report = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("execute returns while paused")
        .unwrap();
    assert!(report.hash.is_some(), "{:?}", report.failures);
    assert!(s.control().is_paused());
    assert_eq!(seen.lock().last(), Some(&EventKind::SessionFinished));
}
