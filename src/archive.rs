//! Workload archive assembly.
//!
//! Turns a root filesystem plus its OCI configuration into a tar stream
//! containing the guest entrypoint, the workload descriptor, and a
//! LUKS-encrypted disk image with a discovery trailer. Production and
//! consumption overlap: the assembler runs on one producer thread writing
//! into a bounded pipe, and the caller reads the other end.
//!
//! External machinery (mkfs, attestation registration, SEV certificate
//! chain export) is reached through the [`Helpers`] traits so callers can
//! substitute their own transports.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{chown, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cipher::{CipherSpec, EncryptionContext};
use crate::config::{TeeType, WorkloadConfig};
use crate::error::Error;
use crate::luks::{encrypt_v1, Passphrase};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::sizing::compute_size;
use crate::writer::SectorWriter;

const DEFAULT_CPUS: u32 = 2;
const DEFAULT_MEMORY_MIB: u32 = 512;
const DEFAULT_TEE: TeeType = TeeType::Snp;

/// `disk.img` total length is padded to this boundary before the trailer.
const IMAGE_ALIGN: u64 = 4096;

/// In-flight write chunks between producer and consumer.
const PIPE_CAPACITY: usize = 16;

const TAR_BLOCK: u64 = 512;

/// Guest entrypoint, bundled gzipped; content is opaque to the assembler.
const ENTRYPOINT_GZ: &[u8] = include_bytes!("../data/entrypoint.gz");

// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------

/// Formats the plaintext image in place, populating it from the rootfs.
pub trait DiskFormatter: Send + Sync {
    fn format(&self, rootfs: &Path, image: &Path, fstype: &str) -> Result<(), Error>;
}

/// Writes the SEV certificate chain to the given path.
pub trait ChainExporter: Send + Sync {
    fn export(&self, path: &Path) -> Result<(), Error>;
}

/// Registers a workload with an attestation server.
pub trait AttestationClient: Send + Sync {
    fn register(
        &self,
        url: &str,
        config: &WorkloadConfig,
        passphrase: &str,
    ) -> Result<(), Error>;
}

/// Shells out to `mkfs.<fstype>`, seeding the filesystem from the rootfs.
pub struct SystemMkfs;

impl DiskFormatter for SystemMkfs {
    fn format(&self, rootfs: &Path, image: &Path, fstype: &str) -> Result<(), Error> {
        let output = Command::new(format!("mkfs.{}", fstype))
            .arg("-q")
            .arg("-d")
            .arg(rootfs)
            .arg(image)
            .output()
            .map_err(|e| Error::MkfsFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::MkfsFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

/// Shells out to `sevctl export --full`.
pub struct SevctlChainExporter;

impl ChainExporter for SevctlChainExporter {
    fn export(&self, path: &Path) -> Result<(), Error> {
        let output = Command::new("sevctl")
            .args(["export", "--full"])
            .arg(path)
            .output()
            .map_err(|e| Error::ChainExportFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::ChainExportFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

/// Placeholder client: HTTP transport lives outside this crate, so
/// registration requests fail until a real client is injected.
pub struct NoAttestation;

impl AttestationClient for NoAttestation {
    fn register(&self, _: &str, _: &WorkloadConfig, _: &str) -> Result<(), Error> {
        Err(Error::AttestationFailed(
            "no attestation client configured".to_string(),
        ))
    }
}

/// The collaborator bag handed to [`Archiver`].
#[derive(Clone)]
pub struct Helpers {
    pub mkfs: Arc<dyn DiskFormatter>,
    pub chain: Arc<dyn ChainExporter>,
    pub attestation: Arc<dyn AttestationClient>,
}

impl Helpers {
    pub fn system() -> Self {
        Self {
            mkfs: Arc::new(SystemMkfs),
            chain: Arc::new(SevctlChainExporter),
            attestation: Arc::new(NoAttestation),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Option bag for one archive run. Zero values select the documented
/// defaults.
#[derive(Clone, Default)]
pub struct ArchiveOptions {
    /// Non-empty: register with the attestation collaborator before
    /// streaming.
    pub attestation_url: String,
    pub cpus: u32,
    pub memory_mib: u32,
    /// `SEV`, `SEV_NO_ES`, or `SNP`; empty selects `SNP`.
    pub tee_type: String,
    /// Content-addressed workload identifier; derived when empty.
    pub workload_id: String,
    /// Fixed image size in bytes; zero estimates from the rootfs.
    pub image_size: u64,
    /// Sizing slop policy, e.g. `"20%+128M"`.
    pub slop: String,
    /// Hex passphrase for the disk; generated when empty.
    pub disk_encryption_passphrase: String,
    /// Demote certificate-chain export failures to warnings.
    pub ignore_attestation_errors: bool,
    /// In-rootfs destination path → host file to overlay before packing.
    pub extra_image_content: HashMap<String, PathBuf>,
}

// ---------------------------------------------------------------------------
// Archiver
// ---------------------------------------------------------------------------

/// Consuming end of the archive stream.
pub struct ArchiveReader {
    inner: PipeReader,
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

pub struct Archiver {
    helpers: Helpers,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    pub fn new() -> Self {
        Self::with_helpers(Helpers::system())
    }

    pub fn with_helpers(helpers: Helpers) -> Self {
        Self { helpers }
    }

    /// Assemble the archive for `rootfs`.
    ///
    /// Returns the readable stream plus the workload descriptor that was
    /// embedded in it. The producer runs on its own thread and aborts
    /// cleanly when the reader is dropped early.
    pub fn archive(
        &self,
        rootfs: &Path,
        oci_config: &serde_json::Value,
        options: ArchiveOptions,
    ) -> Result<(ArchiveReader, WorkloadConfig), Error> {
        let tee = if options.tee_type.is_empty() {
            DEFAULT_TEE
        } else {
            TeeType::parse(&options.tee_type)?
        };
        let cpus = if options.cpus == 0 { DEFAULT_CPUS } else { options.cpus };
        let memory_mib = if options.memory_mib == 0 {
            DEFAULT_MEMORY_MIB
        } else {
            options.memory_mib
        };
        let workload_id = if options.workload_id.is_empty() {
            default_workload_id(rootfs)
        } else {
            options.workload_id.clone()
        };
        let passphrase_string = if options.disk_encryption_passphrase.is_empty() {
            let mut raw = [0u8; 32];
            OsRng.fill_bytes(&mut raw);
            hex::encode(raw)
        } else {
            options.disk_encryption_passphrase.clone()
        };
        let passphrase = Passphrase::new(passphrase_string.clone().into_bytes())?;

        // TEE preflight: SEV flavors carry a certificate chain when the
        // exporter can produce one.
        let mut chain = None;
        let mut tee_data = match tee {
            TeeType::Snp => r#"{"generation":"milan"}"#.to_string(),
            TeeType::Sev | TeeType::SevNoEs => "{}".to_string(),
        };
        if tee.is_sev() {
            let chain_file = NamedTempFile::new()?;
            match self.helpers.chain.export(chain_file.path()) {
                Ok(()) => {
                    chain = Some(fs::read(chain_file.path())?);
                    tee_data = r#"{"vendor_chain":"/sev.chain"}"#.to_string();
                }
                Err(e) if options.ignore_attestation_errors => {
                    warn!(error = %e, "continuing without a certificate chain");
                }
                Err(e) => return Err(e),
            }
        }

        let workload_config = WorkloadConfig {
            tee,
            workload_id,
            cpus,
            memory_mib,
            attestation_url: options.attestation_url.clone(),
            tee_data,
        };

        // Rootfs preparation: overlay extra content, then drop the OCI
        // config where the guest entrypoint expects it.
        overlay_extra_content(rootfs, &options.extra_image_content)?;
        write_oci_config(rootfs, oci_config)?;

        // Plaintext scratch image, sized and formatted in place.
        let image_size = compute_size(rootfs, options.image_size, &options.slop)?;
        let scratch = NamedTempFile::new()?;
        scratch.as_file().set_len(image_size)?;
        self.helpers
            .mkfs
            .format(rootfs, scratch.path(), "ext4")?;
        debug!(image_size, "formatted plaintext image");

        if !options.attestation_url.is_empty() {
            self.helpers.attestation.register(
                &options.attestation_url,
                &workload_config,
                &passphrase_string,
            )?;
        }

        let (luks_head, context, _sector_size) =
            encrypt_v1(std::slice::from_ref(&passphrase), CipherSpec::default())?;

        let trailer = workload_config.trailer_bytes()?;
        let unpadded = luks_head.len() as u64 + image_size + trailer.len() as u64;
        let padding = (IMAGE_ALIGN - unpadded % IMAGE_ALIGN) % IMAGE_ALIGN;

        let (pipe_writer, pipe_reader) = pipe(PIPE_CAPACITY);
        let config_json = workload_config.to_json()?;

        let job = ProducerJob {
            luks_head,
            context,
            scratch,
            image_size,
            padding,
            trailer,
            config_json,
            chain,
        };
        thread::Builder::new()
            .name("archive-producer".to_string())
            .spawn(move || match job.run(pipe_writer) {
                Ok(()) => debug!("archive stream complete"),
                Err((writer, e)) => {
                    warn!(error = %e, "archive stream failed");
                    if let Some(writer) = writer {
                        writer.abort(e);
                    }
                }
            })?;

        Ok((ArchiveReader { inner: pipe_reader }, workload_config))
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct ProducerJob {
    luks_head: Vec<u8>,
    context: EncryptionContext,
    /// Deleted on drop, whichever way the stream ends.
    scratch: NamedTempFile,
    image_size: u64,
    padding: u64,
    trailer: Vec<u8>,
    config_json: Vec<u8>,
    chain: Option<Vec<u8>>,
}

impl ProducerJob {
    /// Emit the whole archive. On failure the pipe writer is handed back so
    /// the error can be pushed to the consumer.
    fn run(self, pipe_writer: PipeWriter) -> Result<(), (Option<PipeWriter>, Error)> {
        let mut tar = tar::Builder::new(pipe_writer);
        match self.emit(&mut tar) {
            Ok(()) => {
                let mut writer = tar.into_inner().map_err(|e| (None, Error::Io(e)))?;
                writer.flush().map_err(|e| (None, Error::Io(e)))?;
                Ok(())
            }
            Err(e) => Err((tar.into_inner().ok(), e)),
        }
    }

    fn emit(self, tar: &mut tar::Builder<PipeWriter>) -> Result<(), Error> {
        let Self {
            luks_head,
            context,
            scratch,
            image_size,
            padding,
            trailer,
            config_json,
            chain,
        } = self;

        let mut entrypoint = Vec::new();
        GzDecoder::new(ENTRYPOINT_GZ).read_to_end(&mut entrypoint)?;
        append_file(tar, "entrypoint", 0o755, &entrypoint)?;

        if let Some(chain) = &chain {
            append_file(tar, "sev.chain", 0o600, chain)?;
        }
        append_file(tar, "krun-sev.json", 0o600, &config_json)?;
        append_dir(tar, "tmp/", 0o1777)?;

        // disk.img is framed by hand: its size is known up front, but the
        // ciphertext only exists as it streams through the sector writer.
        let disk_len = luks_head.len() as u64 + image_size + padding + trailer.len() as u64;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o600);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(disk_len);
        header.set_path("disk.img")?;
        header.set_cksum();

        let out = tar.get_mut();
        out.write_all(header.as_bytes())?;
        out.write_all(&luks_head)?;

        let plaintext = scratch.reopen()?;
        let mut encryptor = SectorWriter::new(context, tar.get_mut());
        io::copy(&mut plaintext.take(image_size), &mut encryptor)?;
        encryptor.finish()?;

        let out = tar.get_mut();
        write_zeros(out, padding)?;
        out.write_all(&trailer)?;
        write_zeros(out, (TAR_BLOCK - disk_len % TAR_BLOCK) % TAR_BLOCK)?;
        Ok(())
    }
}

fn append_file<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    mode: u32,
    data: &[u8],
) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(data.len() as u64);
    tar.append_data(&mut header, name, data)?;
    Ok(())
}

fn append_dir<W: Write>(tar: &mut tar::Builder<W>, name: &str, mode: u32) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(0);
    tar.append_data(&mut header, name, io::empty())?;
    Ok(())
}

fn write_zeros<W: Write>(w: &mut W, mut n: u64) -> Result<(), Error> {
    let zeros = [0u8; 4096];
    while n > 0 {
        let take = n.min(zeros.len() as u64) as usize;
        w.write_all(&zeros[..take])?;
        n -= take as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rootfs preparation
// ---------------------------------------------------------------------------

/// Copy extra host files into the rootfs view, creating intermediate
/// directories owned like the rootfs root.
fn overlay_extra_content(
    rootfs: &Path,
    extra: &HashMap<String, PathBuf>,
) -> Result<(), Error> {
    if extra.is_empty() {
        return Ok(());
    }

    let root_meta = fs::metadata(rootfs)?;
    let (uid, gid) = (root_meta.uid(), root_meta.gid());

    for (dest, source) in extra {
        let relative = Path::new(dest.trim_start_matches('/'));
        let target = rootfs.join(relative);

        let mut dir = rootfs.to_path_buf();
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                dir.push(component);
                if !dir.exists() {
                    fs::create_dir(&dir)?;
                    chown(&dir, Some(uid), Some(gid))?;
                }
            }
        }

        fs::copy(source, &target)?;
        chown(&target, Some(uid), Some(gid))?;
        debug!(dest = %dest, "overlaid extra image content");
    }
    Ok(())
}

/// Atomically drop the OCI config where the guest entrypoint looks for it.
fn write_oci_config(rootfs: &Path, oci_config: &serde_json::Value) -> Result<(), Error> {
    let data = serde_json::to_vec(oci_config)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let target = rootfs.join(".krun_config.json");
    let staging = rootfs.join(".krun_config.json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staging)?;
        file.write_all(&data)?;
    }
    fs::rename(&staging, &target)?;
    Ok(())
}

fn default_workload_id(rootfs: &Path) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(rootfs.as_os_str().as_encoded_bytes());
    hasher.update(b"ext4");
    hasher.update(now.to_le_bytes());
    hex::encode(hasher.finalize())
}
