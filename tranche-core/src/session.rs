//! Upload coordinator: validates the request, sizes the worker pools, runs
//! them in dependency order and assembles the final report.

use crate::archive::{ArchiveExpander, ZstdExpander};
use crate::config::UploadConfig;
use crate::control::Control;
use crate::error::{ConfigError, ValidationError};
use crate::events::{Event, EventBus, EventKind, Listener, ListenerSet};
use crate::model::{FileFlags, FileSource, FileState};
use crate::net::Connector;
use crate::pipeline::{Pipeline, PipelineParts, WorkItem};
use crate::producer::dataset_path;
use crate::relay::{RelayPlanner, RotatingPlanner};
use crate::replicate::Replicator;
use crate::report::Report;
use crate::topology::{ServerSelection, Topology};
use crate::{data_uploader, meta_uploader, producer};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Everything `execute` needs once validation has passed.
struct Prepared {
    cfg: UploadConfig,
    excludes: GlobSet,
    selection: ServerSelection,
    signing_key: SigningKey,
    base: PathBuf,
    source_is_dir: bool,
    files: u64,
    bytes: u64,
}

pub struct UploadSession {
    config: Mutex<UploadConfig>,
    locked: AtomicBool,
    control: Arc<Control>,
    listeners: ListenerSet,
    topology: Arc<dyn Topology>,
    connector: Arc<dyn Connector>,
    planner: Arc<dyn RelayPlanner>,
    expanders: Vec<Arc<dyn ArchiveExpander>>,
}

impl UploadSession {
    pub fn new(
        config: UploadConfig,
        topology: Arc<dyn Topology>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let control = Arc::new(Control::new(config.poll_interval()));
        Self {
            config: Mutex::new(config),
            locked: AtomicBool::new(false),
            control,
            listeners: Arc::new(RwLock::new(Vec::new())),
            topology,
            connector,
            planner: Arc::new(RotatingPlanner),
            expanders: vec![Arc::new(ZstdExpander)],
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn RelayPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_expander(mut self, expander: Arc<dyn ArchiveExpander>) -> Self {
        self.expanders.push(expander);
        self
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        self.listeners.write().push(listener);
    }

    /// Change the configuration. Fails once `execute` has validated and locked it.
    pub fn configure(&self, f: impl FnOnce(&mut UploadConfig)) -> Result<(), ConfigError> {
        let mut cfg = self.config.lock();
        if self.is_locked() {
            return Err(ConfigError::Locked);
        }
        f(&mut cfg);
        self.control.set_poll(cfg.poll_interval());
        Ok(())
    }

    pub fn config(&self) -> UploadConfig {
        self.config.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    pub fn stop(&self) {
        info!("stop requested");
        self.control.stop();
    }

    /// Hold event delivery to listeners. Uploading continues.
    pub fn pause(&self) {
        self.control.set_paused(true);
    }

    pub fn resume(&self) {
        self.control.set_paused(false);
    }

    /// Run the upload to completion. Validation problems are returned before any
    /// worker starts; everything after that lands in the report.
    pub fn execute(&self) -> Result<Report, ValidationError> {
        let prepared = {
            let mut cfg = self.config.lock();
            if self.is_locked() {
                return Err(ValidationError::AlreadyStarted);
            }
            let prepared = self.validate(&cfg)?;
            cfg.title = prepared.cfg.title.clone();
            self.locked.store(true, Ordering::SeqCst);
            prepared
        };
        Ok(self.run(prepared))
    }

    fn validate(&self, cfg: &UploadConfig) -> Result<Prepared, ValidationError> {
        let mut cfg = cfg.clone();
        if !cfg.source.exists() {
            return Err(ValidationError::MissingSource(cfg.source.clone()));
        }
        let excludes = build_excludes(&cfg.exclude)?;
        let source_is_dir = cfg.source.is_dir();
        let base = cfg
            .source
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| cfg.source.clone());

        let (files, bytes) = if source_is_dir {
            let mut files = 0u64;
            let mut bytes = 0u64;
            for ent in walkdir::WalkDir::new(&cfg.source).min_depth(1) {
                let ent = ent.map_err(std::io::Error::from)?;
                if !ent.file_type().is_file() {
                    continue;
                }
                if excludes.is_match(dataset_path(&base, ent.path())) {
                    continue;
                }
                files += 1;
                bytes += ent.metadata().map_err(std::io::Error::from)?.len();
            }
            (files, bytes)
        } else if cfg.source.is_file() {
            (1, std::fs::metadata(&cfg.source)?.len())
        } else {
            (0, 0)
        };
        if files == 0 {
            return Err(ValidationError::EmptySource(cfg.source.clone()));
        }

        if cfg.title.trim().is_empty() {
            cfg.title = cfg
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| cfg.source.display().to_string());
        }

        let creds = cfg.credentials.as_ref().ok_or(ValidationError::MissingCredentials)?;
        if creds.is_expired(Utc::now()) {
            return Err(ValidationError::ExpiredCredentials(creds.user.clone()));
        }

        if cfg.servers.is_empty() && cfg.sticky_servers.is_empty() && !cfg.use_unspecified_servers {
            return Err(ValidationError::NoServersSelected);
        }
        let selection = ServerSelection {
            selected: if cfg.use_unspecified_servers {
                Vec::new()
            } else {
                cfg.servers.iter().chain(&cfg.sticky_servers).cloned().collect()
            },
            sticky: cfg.sticky_servers.clone(),
        };
        let usable = self
            .topology
            .servers()
            .into_iter()
            .filter(|s| selection.admits(&s.host) && s.is_usable_core())
            .any(|s| match self.connector.connect(&s.host) {
                Ok(_) => true,
                Err(e) => {
                    warn!(host = %s.host, error = %e, "server unreachable during validation");
                    false
                }
            });
        if !usable {
            return Err(ValidationError::NoUsableServers);
        }

        let signing_key = creds.signing_key.clone();
        Ok(Prepared { cfg, excludes, selection, signing_key, base, source_is_dir, files, bytes })
    }

    fn run(&self, prep: Prepared) -> Report {
        let Prepared { cfg, excludes, selection, signing_key, base, source_is_dir, files, bytes } =
            prep;
        self.control.set_poll(cfg.poll_interval());
        let plan = cfg.thread_plan();
        let with_manifest = source_is_dir || cfg.license.is_some();
        let mut report = Report::new(&cfg.title, &cfg.description, cfg.is_encrypted());
        report.files_total = files;
        report.bytes_total = bytes;
        let bus = EventBus::start(report, self.listeners.clone(), self.control.clone());
        let replicator = Replicator {
            topology: self.topology.clone(),
            connector: self.connector.clone(),
            planner: self.planner.clone(),
            selection,
            replication_factor: cfg.replication_factor.max(1),
            control: self.control.clone(),
        };
        let source = cfg.source.clone();
        let license = cfg.license.clone();
        let license_name = cfg.license_name.clone();
        let p = Arc::new(Pipeline::new(PipelineParts {
            cfg,
            control: self.control.clone(),
            bus,
            replicator,
            signing_key,
            excludes,
            expanders: self.expanders.clone(),
            base,
            with_manifest,
            files_estimate: files,
            bytes_estimate: bytes,
        }));

        info!(
            title = %p.cfg.title,
            files,
            bytes,
            producers = plan.producers,
            data_uploaders = plan.data_uploaders,
            meta_uploaders = plan.meta_uploaders,
            "upload started"
        );
        p.publish(Event::new(EventKind::SessionStarted).message(p.cfg.title.clone()));

        if let Some(text) = license {
            let flags = FileFlags { license: true, ..Default::default() };
            p.work.push_back(WorkItem::File(Arc::new(FileState::new(
                license_name,
                FileSource::Synthetic(text.into_bytes()),
                p.padding.clone(),
                flags,
            ))));
        }
        if source_is_dir {
            p.work.push_back(WorkItem::Dir(source));
        } else {
            let flags = FileFlags { primary: !with_manifest, ..Default::default() };
            p.work.push_back(WorkItem::File(Arc::new(FileState::new(
                dataset_path(&p.base, &source),
                FileSource::Path(source),
                p.padding.clone(),
                flags,
            ))));
        }

        self.control.register_data_uploaders(plan.data_uploaders);
        let producers = spawn_pool(&p, "tranche-producer", plan.producers, producer::run);
        let data = spawn_pool(&p, "tranche-data", plan.data_uploaders, data_uploader::run);
        for _ in data.len()..plan.data_uploaders {
            self.control.data_uploader_finished();
        }
        let meta = spawn_pool(&p, "tranche-meta", plan.meta_uploaders, meta_uploader::run);

        join_pool(&p, producers);
        self.control.set_producers_done();
        join_pool(&p, data);
        join_pool(&p, meta);

        self.finish(&p)
    }

    fn finish(&self, p: &Pipeline) -> Report {
        let started = p.files_started.load(Ordering::SeqCst);
        let finished = p.files_finished.load(Ordering::SeqCst);
        let stopped = self.control.is_stopped();
        p.bus.with_report(|r| {
            if stopped {
                r.add_failure(None, None, "upload stopped".into());
            } else if !r.is_failed() && started != finished {
                let msg = format!("only {} of {} files completed", finished, started);
                r.add_failure(None, None, msg);
            }
            r.files_total = p.files_estimate.load(Ordering::SeqCst);
            r.bytes_total = p.bytes_estimate.load(Ordering::SeqCst);
            r.hash = if r.is_failed() { None } else { p.root.get().copied() };
            if r.hash.is_none() && !r.is_failed() {
                r.add_failure(None, None, "no root hash was produced".into());
            }
            r.finished = Some(Utc::now());
        });
        let mut done = Event::new(EventKind::SessionFinished);
        if let Some(h) = p.bus.with_report(|r| r.hash) {
            done = done.hash(h);
        }
        p.publish(done);
        let report = p.bus.close();
        match report.hash {
            Some(h) => info!(hash = %h, files = report.files_uploaded, "upload finished"),
            None => error!(failures = report.failures.len(), "upload failed"),
        }
        report
    }
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet, ValidationError> {
    let mut b = GlobSetBuilder::new();
    for pat in patterns {
        b.add(Glob::new(pat)?);
    }
    Ok(b.build()?)
}

fn spawn_pool(
    p: &Arc<Pipeline>,
    name: &str,
    n: usize,
    work: fn(Arc<Pipeline>),
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let pc = p.clone();
        match thread::Builder::new().name(format!("{}-{}", name, i)).spawn(move || work(pc)) {
            Ok(h) => handles.push(h),
            Err(e) => {
                p.fail_session(&format!("could not start {} thread: {}", name, e));
                break;
            }
        }
    }
    handles
}

fn join_pool(p: &Pipeline, handles: Vec<JoinHandle<()>>) {
    for h in handles {
        let name = h.thread().name().unwrap_or("worker").to_string();
        if h.join().is_err() {
            p.fail_session(&format!("{} panicked", name));
        }
    }
}
