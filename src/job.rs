//! Binding the program loaded on the machine to a local job.
//!
//! Programs generated for the machine start with three comment lines naming
//! the job, the document it came from and a content signature:
//!
//! ```text
//! (Job: Pocket)
//! (File: /home/me/part.FCStd)
//! (Signature: 6b1f...)
//! ```
//!
//! When the machine loads the well-known program file, the synchronizer
//! fetches it, reads that header and compares the signature against the one
//! computed from the local document.  Only an exact match binds the job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use thiserror::Error;
use tokio::time::timeout;

use crate::types::Endpoint;

const JOB_PREFIX: &str = "(Job: ";
const FILE_PREFIX: &str = "(File: ";
const SIGNATURE_PREFIX: &str = "(Signature: ";

/// The local job currently loaded on the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBinding {
    pub title: String,
    pub file_name: String,
    pub signature: String,
}

/// Header embedded at the top of a generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeader {
    pub title: String,
    pub file_name: String,
    pub signature: String,
}

impl JobHeader {
    /// Reads the header from the first three lines, if they carry one.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Option<Self> {
        if lines.len() < 3 {
            return None;
        }
        let field = |line: &str, prefix: &str| {
            line.trim()
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .map(str::to_string)
        };
        Some(Self {
            title: field(lines[0].as_ref(), JOB_PREFIX)?,
            file_name: field(lines[1].as_ref(), FILE_PREFIX)?,
            signature: field(lines[2].as_ref(), SIGNATURE_PREFIX)?,
        })
    }
}

/// A job known to the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    pub title: String,
    /// Source document the job belongs to.
    pub file_name: String,
    pub program: Vec<String>,
}

impl LocalDocument {
    pub fn new(title: impl Into<String>, file_name: impl Into<String>, program: Vec<String>) -> Self {
        Self {
            title: title.into(),
            file_name: file_name.into(),
            program,
        }
    }

    /// Reads a program file.  Files with a header keep its title and source;
    /// others are named after `path`.
    pub fn from_text(text: &str, path: &Path) -> Self {
        let lines: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
        match JobHeader::parse(&lines) {
            Some(header) => Self::new(header.title, header.file_name, lines[3..].to_vec()),
            None => Self::new(
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path.display().to_string(),
                lines,
            ),
        }
    }

    /// SHA-256 over the trimmed program lines, hex encoded.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        for (i, line) in self.program.iter().enumerate() {
            if i > 0 {
                hasher.update(b"\n");
            }
            hasher.update(line.trim().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// The program as uploaded to the machine, header included.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}{})\n{}{})\n{}{})\n",
            JOB_PREFIX,
            self.title,
            FILE_PREFIX,
            self.file_name,
            SIGNATURE_PREFIX,
            self.signature()
        );
        for line in &self.program {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn binding(&self) -> JobBinding {
        JobBinding {
            title: self.title.clone(),
            file_name: self.file_name.clone(),
            signature: self.signature(),
        }
    }
}

/// Lookup of local jobs by source document and title.
pub trait JobCatalog: Send + Sync {
    fn find(&self, file_name: &str, title: &str) -> Option<LocalDocument>;
}

/// In-memory catalog the frontend registers its documents with.
#[derive(Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<(String, String), LocalDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.ngc` program in `dir`.
    pub fn load_dir(dir: &Path) -> std::io::Result<Self> {
        let store = Self::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "ngc").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            match std::fs::read_to_string(&path) {
                Ok(text) => store.register(LocalDocument::from_text(&text, &path)),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(store)
    }

    /// Adds or replaces a document.
    pub fn register(&self, document: LocalDocument) {
        let key = (document.file_name.clone(), document.title.clone());
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, document);
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobCatalog for DocumentStore {
    fn find(&self, file_name: &str, title: &str) -> Option<LocalDocument> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(file_name.to_string(), title.to_string()))
            .cloned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("ftp: {0}")]
    Ftp(#[from] suppaftp::FtpError),
    #[error("fetch from {0} timed out")]
    Timeout(String),
    #[error("fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(String),
}

/// Retrieves a file from the machine's file service.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, endpoint: &Endpoint, name: &str) -> Result<Vec<u8>, FetchError>;
}

/// Anonymous binary FTP retrieval.
pub struct FtpFetcher {
    timeout: Duration,
}

impl FtpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl FileFetcher for FtpFetcher {
    async fn fetch(&self, endpoint: &Endpoint, name: &str) -> Result<Vec<u8>, FetchError> {
        let address = endpoint.address.clone();
        let port = endpoint.port;
        let name = name.to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, FetchError> {
            let mut ftp = FtpStream::connect((address.as_str(), port))?;
            ftp.login("anonymous", "anonymous")?;
            ftp.transfer_type(FileType::Binary)?;
            let data = ftp.retr_as_buffer(&name)?.into_inner();
            if let Err(e) = ftp.quit() {
                debug!("ftp quit failed: {}", e);
            }
            Ok(data)
        });
        match timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(FetchError::Timeout(endpoint.to_string())),
        }
    }
}

/// What the synchronizer looks at on every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncInputs {
    /// `status.task.file`: the program loaded on the machine.
    pub loaded_file: Option<String>,
    /// `status.config.remote_path`: where uploaded programs are stored.
    pub remote_root: Option<String>,
    /// The instance's file service.
    pub endpoint: Option<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub generation: u64,
    pub endpoint: Endpoint,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobNotice {
    Changed(Option<JobBinding>),
    OutOfDate { title: String, file_name: String },
}

/// Per-machine job binding state.
pub struct JobSynchronizer {
    remote_filename: String,
    retry_delay: Duration,
    last: Option<SyncInputs>,
    retry: bool,
    /// A failed fetch is not repeated before this instant.
    retry_at: Option<Instant>,
    generation: u64,
    binding: Option<JobBinding>,
    warning: Option<String>,
}

impl JobSynchronizer {
    pub fn new(remote_filename: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            remote_filename: remote_filename.into(),
            retry_delay,
            last: None,
            retry: true,
            retry_at: None,
            generation: 0,
            binding: None,
            warning: None,
        }
    }

    pub fn binding(&self) -> Option<&JobBinding> {
        self.binding.as_ref()
    }

    /// The last out-of-date warning, cleared by a successful binding.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Full remote path of the well-known program below `root`.
    pub fn remote_path(&self, root: &str) -> String {
        format!("{}/{}", root.trim_end_matches('/'), self.remote_filename)
    }

    /// Decides what to do about `inputs`.  Does nothing unless they changed
    /// since the last check or a retry is due.
    pub fn check(&mut self, inputs: SyncInputs, now: Instant) -> (Option<FetchRequest>, Vec<JobNotice>) {
        if self.last.as_ref() == Some(&inputs) {
            let due = self.retry_at.map_or(true, |at| now >= at);
            if !self.retry || !due {
                return (None, Vec::new());
            }
        }
        self.generation += 1;
        self.last = Some(inputs.clone());

        let (Some(loaded), Some(root), Some(endpoint)) =
            (inputs.loaded_file, inputs.remote_root, inputs.endpoint)
        else {
            debug!("job unknown, machine state incomplete");
            self.retry = true;
            self.retry_at = None;
            return (None, self.set_binding(None));
        };
        self.retry = false;

        if loaded != self.remote_path(&root) {
            debug!("machine runs '{}', not an uploaded job", loaded);
            return (None, self.set_binding(None));
        }
        self.retry_at = Some(now + self.retry_delay);
        let request = FetchRequest {
            generation: self.generation,
            endpoint,
            name: self.remote_filename.clone(),
        };
        (Some(request), Vec::new())
    }

    /// Applies a finished fetch.  Results for outdated requests are ignored;
    /// failures keep the current binding and are retried once the retry
    /// delay since the failed request has passed.
    pub fn complete(
        &mut self,
        request: &FetchRequest,
        result: Result<Vec<u8>, FetchError>,
        catalog: &dyn JobCatalog,
    ) -> Vec<JobNotice> {
        if request.generation != self.generation {
            debug!("discarding fetch for superseded generation {}", request.generation);
            return Vec::new();
        }
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Fetching {} failed: {}", request.name, e);
                self.retry = true;
                return Vec::new();
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("{} is not a text program: {}", request.name, e);
                self.retry = true;
                return Vec::new();
            }
        };
        let lines: Vec<&str> = text.lines().take(3).collect();
        let Some(header) = JobHeader::parse(&lines) else {
            debug!("{} carries no job header", request.name);
            return self.set_binding(None);
        };
        debug!("Loaded document: '{}' - '{}'", header.file_name, header.title);

        let Some(document) = catalog.find(&header.file_name, &header.title) else {
            debug!("no local document for {}", header.file_name);
            return self.set_binding(None);
        };
        let binding = document.binding();
        if binding.signature == header.signature {
            info!("Job {}.{} loaded.", document.file_name, document.title);
            self.warning = None;
            self.set_binding(Some(binding))
        } else {
            let warning = format!("Job {}.{} is out of date!", document.file_name, document.title);
            warn!("{}", warning);
            self.warning = Some(warning);
            let mut notices = vec![JobNotice::OutOfDate {
                title: document.title,
                file_name: document.file_name,
            }];
            notices.extend(self.set_binding(None));
            notices
        }
    }

    fn set_binding(&mut self, binding: Option<JobBinding>) -> Vec<JobNotice> {
        if self.binding == binding {
            return Vec::new();
        }
        self.binding = binding.clone();
        vec![JobNotice::Changed(binding)]
    }
}
