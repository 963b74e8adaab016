//! SFTP subsystem the agent exposes through its reverse tunnel.
//!
//! Tunnel streams that open with the SSH banner are routed into a small
//! embedded SSH server whose only job is the `sftp` subsystem; everything
//! here operates on the real filesystem behind the same allow-list as the
//! JSON-RPC file handlers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use eyre::{eyre, Result};
use russh::{
    server::{self, Auth, Msg},
    ChannelId, Disconnect, MethodSet,
};
use russh_sftp::protocol::{
    Attrs, Data, File as SftpFile, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode,
    Version,
};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    policy::{PathPolicy, PolicyError},
    protocol::TUNNEL_USER,
};

/// Filesystem-backed `russh_sftp` handler with allow-list enforcement on
/// every path.
pub struct SftpHandler {
    policy: PathPolicy,
    files: HashMap<String, tokio::fs::File>,
    dirs: HashMap<String, Vec<SftpFile>>,
    next_handle: u64,
}

impl SftpHandler {
    #[must_use]
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 0,
        }
    }

    fn next_handle(&mut self, prefix: &str) -> String {
        self.next_handle += 1;
        format!("{prefix}{}", self.next_handle)
    }
}

fn status_ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn denied(error: &PolicyError) -> StatusCode {
    debug!(%error, "sftp path rejected");
    StatusCode::PermissionDenied
}

fn io_status(error: &std::io::Error) -> StatusCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn attrs_from_metadata(meta: &std::fs::Metadata) -> FileAttributes {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.permissions().mode()),
        atime: Some(meta.atime().max(0) as u32),
        mtime: Some(meta.mtime().max(0) as u32),
        ..Default::default()
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "sftp session initialized");

        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.policy.resolve(&filename).map_err(|e| denied(&e))?;

        let writing = pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::APPEND);
        if writing {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_status(&e))?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ) || !writing)
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(writing || pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .open(&path)
            .await
            .map_err(|e| io_status(&e))?;

        let handle = self.next_handle("file-");
        self.files.insert(handle.clone(), file);

        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(mut file) = self.files.remove(&handle) {
            let _flushed = file.flush().await;
        }
        self.dirs.remove(&handle);

        Ok(status_ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        use tokio::io::AsyncReadExt;

        let file = self.files.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;

        let mut data = vec![0_u8; len as usize];
        let mut filled = 0;
        // Short reads at EOF are allowed; a zero-byte read there is EOF.
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Err(StatusCode::Eof);
        }

        data.truncate(filled);

        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;

        Ok(status_ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.policy.resolve(&path).map_err(|e| denied(&e))?;

        let meta = tokio::fs::metadata(&path).await.map_err(|e| io_status(&e))?;
        if !meta.is_dir() {
            return Err(StatusCode::PermissionDenied);
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path).await.map_err(|e| io_status(&e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_status(&e))? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            let attrs = entry
                .metadata()
                .await
                .map(|meta| attrs_from_metadata(&meta))
                .unwrap_or_default();

            entries.push(SftpFile {
                filename: filename.clone(),
                longname: filename,
                attrs,
            });
        }

        let handle = self.next_handle("dir-");
        self.dirs.insert(handle.clone(), entries);

        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = self.dirs.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;

        if entries.is_empty() {
            return Err(StatusCode::Eof);
        }

        let files = std::mem::take(entries);

        Ok(Name { id, files })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        // Resolution is unconditional so clients can navigate; the actual
        // operation on a denied path fails with PermissionDenied instead.
        let resolved = self
            .policy
            .resolve_unchecked(&path)
            .map_err(|_| StatusCode::NoSuchFile)?;

        Ok(Name {
            id,
            files: vec![SftpFile {
                filename: resolved.to_string_lossy().into_owned(),
                longname: resolved.to_string_lossy().into_owned(),
                attrs: FileAttributes::default(),
            }],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.policy.resolve(&path).map_err(|e| denied(&e))?;

        tokio::fs::metadata(&path)
            .await
            .map(|meta| Attrs {
                id,
                attrs: attrs_from_metadata(&meta),
            })
            .map_err(|e| io_status(&e))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.policy.resolve(&path).map_err(|e| denied(&e))?;

        tokio::fs::symlink_metadata(&path)
            .await
            .map(|meta| Attrs {
                id,
                attrs: attrs_from_metadata(&meta),
            })
            .map_err(|e| io_status(&e))
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.files.get(&handle).ok_or(StatusCode::NoSuchFile)?;

        file.metadata()
            .await
            .map(|meta| Attrs {
                id,
                attrs: attrs_from_metadata(&meta),
            })
            .map_err(|e| io_status(&e))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.policy.resolve(&filename).map_err(|e| denied(&e))?;

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_status(&e))?;

        Ok(status_ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.policy.resolve(&path).map_err(|e| denied(&e))?;

        tokio::fs::create_dir(&path).await.map_err(|e| io_status(&e))?;

        let mode = attrs.permissions.unwrap_or(0o755);
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| io_status(&e))?;

        Ok(status_ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.policy.resolve(&path).map_err(|e| denied(&e))?;

        tokio::fs::remove_dir(&path).await.map_err(|e| io_status(&e))?;

        Ok(status_ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let oldpath = self.policy.resolve(&oldpath).map_err(|e| denied(&e))?;
        let newpath = self.policy.resolve(&newpath).map_err(|e| denied(&e))?;

        tokio::fs::rename(&oldpath, &newpath)
            .await
            .map_err(|e| io_status(&e))?;

        Ok(status_ok(id))
    }
}

/// Serve one tunnel stream that opened with the SSH banner: run an embedded
/// SSH server whose only subsystem is sftp.
pub async fn serve_ssh<S>(stream: S, policy: PathPolicy) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = russh_keys::key::KeyPair::generate_ed25519()
        .ok_or_else(|| eyre!("failed to generate host key for sftp endpoint"))?;

    let config = Arc::new(server::Config {
        keys: vec![key],
        methods: MethodSet::NONE,
        inactivity_timeout: Some(Duration::from_secs(600)),
        ..Default::default()
    });

    let session = server::run_stream(config, stream, TunnelSshSession::new(policy)).await?;
    session.await?;

    Ok(())
}

/// Per-stream SSH session on the agent end of the tunnel.
struct TunnelSshSession {
    policy: PathPolicy,
    channels: HashMap<ChannelId, Option<russh::Channel<Msg>>>,
}

impl TunnelSshSession {
    fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            channels: HashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl server::Handler for TunnelSshSession {
    type Error = eyre::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        if user == TUNNEL_USER {
            return Ok(Auth::Accept);
        }

        warn!(user, "rejected tunnel sftp user");

        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        _: &mut server::Session,
    ) -> Result<bool> {
        self.channels.insert(channel.id(), Some(channel));

        Ok(true)
    }

    async fn channel_eof(&mut self, id: ChannelId, session: &mut server::Session) -> Result<()> {
        // A consumed-but-open channel is tracked as None; only channels we
        // still own should be closed here.
        if self.channels.remove(&id).is_some() {
            session.close(id);
        }

        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<()> {
        debug!(subsystem = name, "tunnel subsystem request");

        if name != "sftp" {
            session.channel_failure(id);
            session.disconnect(
                Disconnect::ByApplication,
                format!("unsupported subsystem: {name}").as_str(),
                "",
            );

            return Ok(());
        }

        let Some(channel) = self
            .channels
            .remove(&id)
            .ok_or_else(|| eyre!("channel not found: {id}"))?
        else {
            return Err(eyre!("channel {id} already consumed"));
        };

        self.channels.insert(id, None);

        let handler = SftpHandler::new(self.policy.clone());
        russh_sftp::server::run(channel.into_stream(), handler).await;

        session.channel_success(id);

        Ok(())
    }
}
