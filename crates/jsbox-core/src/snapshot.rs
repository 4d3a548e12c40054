use std::fmt;
use std::sync::Arc;
use std::thread;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::callback::panic_message;
use crate::error::{Error, Result};
use crate::platform;

const MAGIC: &[u8; 8] = b"JSBXSNAP";
const DIGEST_LEN: usize = 32;
/// The engine stamps its version into the fixed-size header of every blob.
const BLOB_HEADER_LEN: usize = 128;

/// A startup snapshot: engine heap state captured after running some setup
/// script, so new contexts start with its globals already defined.
///
/// Serialised form: magic, engine version (u16 length + bytes), blob length
/// (u64), SHA-256 of the blob, blob. All integers little-endian. Blobs are
/// only handed to the engine after the envelope checks out, since the engine
/// trusts snapshot bytes completely.
///
/// The envelope catches truncation, corruption and version skew. It is not
/// an authenticity check: a blob wrapped by anything other than
/// [`Snapshot::to_bytes`] can still abort the process when an isolate loads
/// it, so snapshot files must come from a trusted source.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    blob: Arc<[u8]>,
}

impl Snapshot {
    /// Builds a snapshot whose default context has evaluated `source`.
    pub fn create(source: &str) -> Result<Self> {
        Self::build(source.to_string(), None)
    }

    /// Like [`Snapshot::create`], but first runs `warmup` against `source` in
    /// a throwaway context so the functions it exercises are compiled into
    /// the snapshot. Globals created by `warmup` are not kept.
    pub fn create_warmed(source: &str, warmup: &str) -> Result<Self> {
        Self::build(source.to_string(), Some(warmup.to_string()))
    }

    fn build(source: String, warmup: Option<String>) -> Result<Self> {
        let lease = platform::acquire()?;
        // The snapshot creator enters its isolate; keep that off the caller's thread.
        let builder = thread::Builder::new()
            .name("jsbox-snapshot".into())
            .spawn(move || {
                let blob = build_blob(&source, warmup.as_deref());
                drop(lease);
                blob
            })
            .map_err(|err| {
                Error::EngineInit(format!("failed to spawn snapshot builder: {}", err))
            })?;
        let blob = builder.join().map_err(|payload| {
            let message = panic_message(payload.as_ref());
            Error::EngineInit(format!("snapshot builder panicked: {}", message))
        })??;
        info!(bytes = blob.len(), "Snapshot created");
        Ok(Self { blob: blob.into() })
    }

    /// Parses bytes produced by [`Snapshot::to_bytes`]. Anything malformed,
    /// corrupted or built by a different engine version is rejected, as is a
    /// blob whose header lacks the engine's version stamp.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, offset: 0 };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(invalid("missing snapshot header"));
        }
        let version_len = u16::from_le_bytes(reader.array()?) as usize;
        let version = reader.take(version_len)?;
        if version != v8::V8::get_version().as_bytes() {
            return Err(invalid(&format!(
                "built by engine {}, running {}",
                String::from_utf8_lossy(version),
                v8::V8::get_version()
            )));
        }
        let blob_len = u64::from_le_bytes(reader.array()?);
        let digest: [u8; DIGEST_LEN] = reader.array()?;
        let blob_len = usize::try_from(blob_len).map_err(|_| invalid("blob too large"))?;
        let blob = reader.take(blob_len)?;
        if reader.offset != bytes.len() {
            return Err(invalid("trailing bytes after blob"));
        }
        if blob.is_empty() {
            return Err(invalid("empty blob"));
        }
        if Sha256::digest(blob).as_slice() != digest {
            return Err(invalid("checksum mismatch"));
        }
        if !stamped_with_engine_version(blob) {
            return Err(invalid("blob was not produced by this engine"));
        }
        Ok(Self { blob: blob.into() })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let version = v8::V8::get_version().as_bytes();
        let capacity = MAGIC.len() + 2 + version.len() + 8 + DIGEST_LEN + self.blob.len();
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(version.len() as u16).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&(self.blob.len() as u64).to_le_bytes());
        out.extend_from_slice(&Sha256::digest(&self.blob));
        out.extend_from_slice(&self.blob);
        out
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    pub(crate) fn blob(&self) -> &[u8] {
        &self.blob
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("bytes", &self.blob.len()).finish()
    }
}

fn stamped_with_engine_version(blob: &[u8]) -> bool {
    let version = v8::V8::get_version().as_bytes();
    let header = &blob[..blob.len().min(BLOB_HEADER_LEN)];
    header.windows(version.len()).any(|window| window == version)
}

fn invalid(reason: &str) -> Error {
    Error::EngineInit(format!("invalid snapshot: {}", reason))
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(invalid("truncated"));
        };
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn build_blob(source: &str, warmup: Option<&str>) -> Result<Vec<u8>> {
    let mut creator = v8::Isolate::snapshot_creator(None, None);
    {
        let scope = &mut v8::HandleScope::new(&mut creator);
        if let Some(warmup) = warmup {
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);
            run(scope, source, "source")?;
            run(scope, warmup, "warm-up")?;
        }
        let context = v8::Context::new(scope, Default::default());
        {
            let scope = &mut v8::ContextScope::new(scope, context);
            run(scope, source, "source")?;
        }
        scope.set_default_context(context);
    }
    creator
        .create_blob(v8::FunctionCodeHandling::Keep)
        .map(|blob| blob.to_vec())
        .ok_or_else(|| Error::EngineInit("engine could not serialise the snapshot".into()))
}

fn run(scope: &mut v8::HandleScope, source: &str, what: &str) -> Result<()> {
    let tc = &mut v8::TryCatch::new(scope);
    let code = v8::String::new(tc, source)
        .ok_or_else(|| Error::EngineInit(format!("snapshot {} is too large", what)))?;
    let completed =
        v8::Script::compile(tc, code, None).and_then(|script| script.run(tc)).is_some();
    if completed {
        return Ok(());
    }
    let message = tc
        .exception()
        .and_then(|e| e.to_string(tc))
        .map(|s| s.to_rust_string_lossy(tc))
        .unwrap_or_else(|| "unknown error".into());
    Err(Error::EngineInit(format!("snapshot {} failed: {}", what, message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shaped like an engine blob: a few header words, then the version.
    fn stamped_blob() -> Vec<u8> {
        let mut blob = vec![0u8; 12];
        blob.extend_from_slice(v8::V8::get_version().as_bytes());
        blob.resize(76, 0);
        blob.extend_from_slice(b"payload");
        blob
    }

    fn envelope(blob: &[u8]) -> Vec<u8> {
        Snapshot { blob: blob.into() }.to_bytes()
    }

    #[test]
    fn envelope_round_trips() {
        let blob = stamped_blob();
        let snapshot = Snapshot::from_bytes(&envelope(&blob));
        assert_eq!(snapshot.ok().map(|s| s.blob().to_vec()), Some(blob));
    }

    #[test]
    fn blobs_without_the_engine_stamp_are_rejected() {
        let err = Snapshot::from_bytes(&envelope(b"blob-bytes")).expect_err("unstamped blob");
        assert!(matches!(err, Error::EngineInit(m) if m.contains("not produced by this engine")));

        let mut late = vec![0u8; BLOB_HEADER_LEN];
        late.extend_from_slice(v8::V8::get_version().as_bytes());
        assert!(Snapshot::from_bytes(&envelope(&late)).is_err());
    }

    #[test]
    fn corrupted_blob_fails_checksum() {
        let mut bytes = envelope(&stamped_blob());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(Error::EngineInit(m)) if m.contains("checksum")
        ));
    }

    #[test]
    fn garbage_and_truncation_are_rejected() {
        assert!(matches!(Snapshot::from_bytes(b"not a snapshot"), Err(Error::EngineInit(_))));
        assert!(matches!(Snapshot::from_bytes(&[]), Err(Error::EngineInit(_))));
        let bytes = envelope(&stamped_blob());
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(Snapshot::from_bytes(truncated), Err(Error::EngineInit(_))));
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(Snapshot::from_bytes(&padded), Err(Error::EngineInit(_))));
    }

    #[test]
    fn other_engine_versions_are_rejected() {
        let mut bytes = envelope(&stamped_blob());
        // First version byte sits right after the magic and length prefix.
        bytes[MAGIC.len() + 2] ^= 0x01;
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(Error::EngineInit(m)) if m.contains("engine")
        ));
    }
}
