//! # krunpack
//!
//! Encrypted workload disk images for AMD SEV confidential VMs.
//!
//! Takes a container root filesystem plus its OCI configuration and emits a
//! tar stream holding the guest entrypoint, the workload descriptor, and a
//! LUKS1-encrypted disk image with an in-band discovery trailer: everything
//! a SEV / SEV-ES / SEV-SNP launcher needs to boot the workload.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::io::Read;
//! use krunpack::{ArchiveOptions, Archiver};
//!
//! let archiver = Archiver::new();
//! let oci_config = serde_json::json!({ "Entrypoint": ["/bin/server"] });
//!
//! let options = ArchiveOptions {
//!     tee_type: "SNP".into(),
//!     cpus: 4,
//!     memory_mib: 2048,
//!     ..Default::default()
//! };
//!
//! let (mut stream, config) = archiver
//!     .archive("/var/lib/workload/rootfs".as_ref(), &oci_config, options)
//!     .unwrap();
//! println!("packed workload {}", config.workload_id);
//!
//! let mut archive = Vec::new();
//! stream.read_to_end(&mut archive).unwrap();
//! ```
//!
//! ## Pieces
//!
//! - **Serpent**: in-tree block cipher, selectable as a LUKS payload cipher
//! - **LUKS v1**: header codec, keyslot wrapping, passphrase recovery
//! - **Sector encryption**: XTS and CBC-ESSIV streaming, one sector at a time
//! - **Trailer codec**: `"KRUN"`-tagged config recovery from the disk alone
//! - **Assembler**: concurrent tar production over a bounded pipe
//!
//! ## What's NOT Provided
//!
//! - LUKS v2 encryption
//! - Attestation transport (inject an [`AttestationClient`])
//! - Overlay mounting; callers hand in a writable rootfs view
//! - TEEs other than SEV / SEV-ES / SEV-SNP

#![deny(unsafe_code)]

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

mod archive;
mod cipher;
mod config;
mod error;
mod pipe;
mod serpent;
mod sizing;
mod writer;

pub mod luks;

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

pub use archive::{
    ArchiveOptions, ArchiveReader, Archiver, AttestationClient, ChainExporter, DiskFormatter,
    Helpers, NoAttestation, SevctlChainExporter, SystemMkfs,
};
pub use cipher::{
    CipherMode, CipherName, CipherSpec, EncryptionContext, SectorCipher, SECTOR_SIZE,
};
pub use config::{
    read_config_from_image, write_config_to_image, TeeType, WorkloadConfig, TRAILER_MAGIC,
    TRAILER_OVERHEAD,
};
pub use error::Error;
pub use serpent::{Serpent, BLOCK_SIZE as SERPENT_BLOCK_SIZE};
pub use sizing::compute_size;
pub use writer::SectorWriter;
