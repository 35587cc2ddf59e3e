//! Producer workers: walk the source depth-first, run every file through its
//! encoding chain and feed the resulting chunks to the data queue.

use crate::archive::{validate_member, ArchiveExpander};
use crate::config::UploadConfig;
use crate::encoding::{content_hash, EncodingChain, EncodingOptions, SEGMENT_SIZE};
use crate::events::{Event, EventKind};
use crate::hash::ContentHash;
use crate::model::{
    Annotation, DataChunk, DatasetManifest, FileFlags, FileSource, FileState, ManifestEntry,
    Properties, Signature, UploaderEntry,
};
use crate::pipeline::{Pipeline, WorkItem};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Consecutive idle polls required before the manifest is built.
pub const MANIFEST_DEBOUNCE_POLLS: u32 = 3;
pub const MANIFEST_NAME: &str = ".tranche-manifest.json";

pub(crate) fn run(p: Arc<Pipeline>) {
    let mut idle_polls = 0u32;
    loop {
        if p.control.should_halt() {
            break;
        }
        if let Some((item, _busy)) = p.work.pop() {
            idle_polls = 0;
            match item {
                WorkItem::Dir(dir) => {
                    if let Err(e) = expand_dir(&p, &dir) {
                        p.fail_session(&format!("{:#}", e));
                    }
                }
                WorkItem::File(file) => process_file(&p, file),
            }
            continue;
        }
        if p.work.is_idle() {
            if !p.with_manifest || p.manifest_claimed.load(Ordering::SeqCst) {
                break;
            }
            idle_polls += 1;
            if idle_polls >= MANIFEST_DEBOUNCE_POLLS {
                claim_manifest(&p);
                continue;
            }
        } else {
            idle_polls = 0;
        }
        if !p.control.nap() {
            break;
        }
    }
    debug!("producer exiting");
}

/// Data-set path of `path`, relative to the parent of the source, with `/` separators.
pub(crate) fn dataset_path(base: &Path, path: &Path) -> String {
    let rel = pathdiff::diff_paths(path, base)
        .or_else(|| path.file_name().map(Into::into))
        .unwrap_or_else(|| path.to_path_buf());
    rel.to_string_lossy().replace('\\', "/")
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn expand_dir(p: &Pipeline, dir: &Path) -> Result<()> {
    let mut children = fs::read_dir(dir)
        .with_context(|| format!("read dir {:?}", dir))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("read dir {:?}", dir))?;
    children.sort_by_key(|e| e.file_name());
    let mut items = Vec::with_capacity(children.len());
    for ent in children {
        let path = ent.path();
        let ft = ent.file_type().with_context(|| format!("stat {:?}", path))?;
        if ft.is_dir() {
            items.push(WorkItem::Dir(path));
            continue;
        }
        if !ft.is_file() {
            continue;
        }
        let rel = dataset_path(&p.base, &path);
        if p.excludes.is_match(&rel) {
            debug!(file = %rel, "excluded");
            continue;
        }
        items.push(WorkItem::File(Arc::new(FileState::new(
            rel,
            FileSource::Path(path),
            p.padding.clone(),
            FileFlags::default(),
        ))));
    }
    p.work.push_front_all(items);
    Ok(())
}

fn process_file(p: &Arc<Pipeline>, file: Arc<FileState>) {
    if let Some(x) = expander_for(p, &file) {
        if let Err(e) = expand_archive(p, &file, x.as_ref()) {
            p.fail_file(&file, None, format!("{:#}", e));
        }
        return;
    }
    if let Err(e) = produce(p, &file) {
        p.fail_file(&file, None, format!("{:#}", e));
    }
}

fn expander_for(p: &Pipeline, file: &FileState) -> Option<Arc<dyn ArchiveExpander>> {
    if !p.cfg.expand_archives || file.flags.is_synthetic() {
        return None;
    }
    if !matches!(file.source, FileSource::Path(_)) {
        return None;
    }
    let name = file_name(&file.rel_path);
    p.expanders.iter().find(|x| x.matches(name)).cloned()
}

fn expand_archive(p: &Pipeline, file: &FileState, x: &dyn ArchiveExpander) -> Result<()> {
    let FileSource::Path(src) = &file.source else {
        bail!("{} is not backed by a file", file.rel_path);
    };
    let dest = p.scratch_dir().context("create scratch directory")?;
    let members = x.expand(src, &dest).with_context(|| format!("expand {}", file.rel_path))?;
    let parent = match file.rel_path.rsplit_once('/') {
        Some((d, _)) => format!("{}/", d),
        None => String::new(),
    };
    let container_size = fs::metadata(src).map(|m| m.len()).unwrap_or(0);

    let mut items = Vec::with_capacity(members.len());
    let mut member_bytes = 0u64;
    for m in &members {
        validate_member(m)?;
        let path = dest.join(m);
        let md = fs::metadata(&path).with_context(|| format!("stat {:?}", path))?;
        if !md.is_file() {
            continue;
        }
        let rel = format!("{}{}", parent, m.to_string_lossy().replace('\\', "/"));
        if p.excludes.is_match(&rel) {
            continue;
        }
        member_bytes += md.len();
        items.push(WorkItem::File(Arc::new(FileState::new(
            rel,
            FileSource::Path(path),
            p.padding.clone(),
            FileFlags::default(),
        ))));
    }

    p.files_estimate.fetch_add(items.len() as u64, Ordering::SeqCst);
    p.files_estimate.fetch_sub(1, Ordering::SeqCst);
    p.bytes_estimate.fetch_add(member_bytes, Ordering::SeqCst);
    let _ = p.bytes_estimate.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
        Some(b.saturating_sub(container_size))
    });
    info!(archive = %file.rel_path, members = items.len(), "archive expanded");
    p.publish(
        Event::new(EventKind::ArchiveExpanded)
            .file(&file.rel_path)
            .bytes(member_bytes)
            .message(format!("{} members", items.len())),
    );
    p.work.push_front_all(items);
    Ok(())
}

fn dataset_annotations(cfg: &UploadConfig) -> Vec<Annotation> {
    let mut out = vec![Annotation { name: "Tranche:Title".into(), value: cfg.title.clone() }];
    if !cfg.description.is_empty() {
        out.push(Annotation { name: "Tranche:Description".into(), value: cfg.description.clone() });
    }
    if cfg.is_encrypted() {
        out.push(Annotation { name: "Tranche:Encrypted".into(), value: "true".into() });
    }
    out.extend(cfg.annotations.iter().cloned());
    out
}

/// Encode one file, queueing its chunks, then finish its signed record.
fn produce(p: &Arc<Pipeline>, file: &Arc<FileState>) -> Result<()> {
    p.files_started.fetch_add(1, Ordering::SeqCst);
    p.publish(
        Event::new(EventKind::FileStarted)
            .file(&file.rel_path)
            .synthetic(file.flags.is_synthetic()),
    );
    debug!(file = %file.rel_path, "encoding");

    let opts = EncodingOptions {
        passphrase: p.cfg.passphrase.as_deref(),
        compress: p.cfg.compress,
        dataset_path: &file.rel_path,
    };
    let (pc, fc) = (p.clone(), file.clone());
    let emit = move |bytes: Vec<u8>| -> io::Result<()> {
        let hash = ContentHash::of(&bytes);
        fc.record_chunk(hash);
        let chunk = DataChunk { hash, bytes, file: fc.clone(), servers_tried: 0 };
        pc.data_q.push(chunk, &pc.control).map_err(io::Error::other)
    };
    let mut chain = EncodingChain::new(&opts, p.cfg.effective_chunk_size(), emit)
        .context("build encoding chain")?;

    let (size, modified) = match &file.source {
        FileSource::Path(path) => {
            let mut f = File::open(path).with_context(|| format!("open {:?}", path))?;
            let md = f.metadata().with_context(|| format!("stat {:?}", path))?;
            let mut buf = vec![0u8; SEGMENT_SIZE];
            let mut total = 0u64;
            loop {
                if p.control.should_halt() {
                    bail!("halted while reading {}", file.rel_path);
                }
                let n = f.read(&mut buf).with_context(|| format!("read {:?}", path))?;
                if n == 0 {
                    break;
                }
                chain.write_all(&buf[..n]).with_context(|| format!("encode {}", file.rel_path))?;
                total += n as u64;
            }
            (total, md.modified().ok().map(DateTime::<Utc>::from))
        }
        FileSource::Synthetic(bytes) => {
            chain.write_all(bytes).with_context(|| format!("encode {}", file.rel_path))?;
            (bytes.len() as u64, None)
        }
    };
    chain.write_all(&file.padding).context("write padding")?;
    let encodings = chain.finish().with_context(|| format!("finish {}", file.rel_path))?;
    let hash = content_hash(&encodings).context("encoding chain produced no content hash")?;

    let mut entry = UploaderEntry {
        signature: Signature::sign(&p.signing_key, &hash),
        encodings,
        properties: Properties {
            name: file_name(&file.rel_path).to_string(),
            dataset_path: file.rel_path.clone(),
            size,
            modified,
            uploaded: Utc::now(),
        },
        annotations: Vec::new(),
        sticky_servers: Vec::new(),
        parts: Vec::new(),
    };
    if file.flags.primary {
        entry.annotations = dataset_annotations(&p.cfg);
        entry.sticky_servers = p.cfg.sticky_servers.clone();
    }
    file.finish(hash, entry);

    {
        let mut m = p.manifest.lock();
        if file.flags.license {
            m.license = Some(hash);
            m.license_done = true;
        } else if !file.flags.manifest && p.with_manifest {
            m.entries.push(ManifestEntry {
                path: file.rel_path.clone(),
                hash,
                padding: file.padding.clone(),
            });
        }
    }
    if file.flags.primary {
        let _ = p.root.set(hash);
    }
    info!(file = %file.rel_path, hash = %hash.short(), chunks = file.produced(), "file encoded");
    p.hand_off_record(file);
    Ok(())
}

/// Build the manifest once every data-set file is encoded. Only one producer
/// claims it; a count that never converges fails the session.
fn claim_manifest(p: &Pipeline) {
    if p.manifest_claimed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
    {
        return;
    }
    let expected = p.files_estimate.load(Ordering::SeqCst);
    let manifest = {
        let m = p.manifest.lock();
        let license_ok = p.cfg.license.is_none() || m.license_done;
        if m.entries.len() as u64 != expected || !license_ok {
            let msg = format!(
                "data set changed during upload: {} of {} expected files encoded",
                m.entries.len(),
                expected
            );
            drop(m);
            p.fail_session(&msg);
            return;
        }
        DatasetManifest { entries: m.entries.clone(), license: m.license }
    };
    let bytes = match manifest.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            p.fail_session(&format!("serialize manifest: {}", e));
            return;
        }
    };
    info!(entries = manifest.entries.len(), "manifest ready");
    let flags = FileFlags { primary: true, manifest: true, license: false };
    p.work.push_front_all(vec![WorkItem::File(Arc::new(FileState::new(
        MANIFEST_NAME.into(),
        FileSource::Synthetic(bytes),
        p.padding.clone(),
        flags,
    )))]);
}
