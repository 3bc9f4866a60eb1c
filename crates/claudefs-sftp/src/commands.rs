//! Filesystem command handlers

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::attrs::{longname, FileAttrs};
use crate::dispatch::Call;
use crate::error::{Result, SftpError};
use crate::handles::HandleObject;
use crate::ordering::HandleKey;
use crate::reply::NameEntry;

pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;
/// Newline translation; a no-op since the server's newline is "\n"
pub const SSH_FXF_TEXT: u32 = 0x0000_0040;

/// Largest READ the server answers in one DATA reply.
pub const MAX_READ_LEN: u32 = 256 * 1024;

fn open_options(pflags: u32, attrs: &FileAttrs) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(pflags & SSH_FXF_READ != 0)
        .write(pflags & SSH_FXF_WRITE != 0)
        .append(pflags & SSH_FXF_APPEND != 0);
    if pflags & SSH_FXF_CREAT != 0 {
        if pflags & SSH_FXF_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
    }
    if pflags & SSH_FXF_TRUNC != 0 {
        opts.truncate(true);
    }
    opts.mode(attrs.permissions.map(|p| p & 0o7777).unwrap_or(0o666));
    opts
}

pub fn sftp_open(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let pflags = call.args.decode_u32()?;
    let attrs = call.attrs()?;
    if pflags & (SSH_FXF_READ | SSH_FXF_WRITE | SSH_FXF_APPEND) == 0 {
        return Err(SftpError::BadMessage {
            reason: "open without read or write access".to_string(),
        });
    }
    let file = open_options(pflags, &attrs).open(&path)?;
    debug!(path = %path.display(), pflags, "open");
    let handle = call.session.handles().insert(HandleObject::File { file, path });
    call.send_handle(&handle)
}

/// Closes a handle once every earlier operation queued on it has finished.
pub fn sftp_close(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    call.session
        .tracker()
        .wait_drained(&HandleKey::new(handle.clone()), call.serial);
    drop(call.session.handles().remove(&handle)?);
    call.send_ok()
}

pub fn sftp_read(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    let offset = call.args.decode_u64()?;
    let len = call.args.decode_u32()?.min(MAX_READ_LEN) as usize;
    let object = call.session.handles().get(&handle)?;
    let guard = object.lock();
    let HandleObject::File { file, .. } = &*guard else {
        return Err(SftpError::InvalidHandle);
    };

    let mut buf = call.arena.alloc(len);
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    drop(guard);
    if filled == 0 && len > 0 {
        return Err(SftpError::Eof);
    }
    call.send_data(&buf[..filled])
}

pub fn sftp_write(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    let offset = call.args.decode_u64()?;
    let data = call.args.decode_bytes()?;
    let object = call.session.handles().get(&handle)?;
    {
        let guard = object.lock();
        let HandleObject::File { file, .. } = &*guard else {
            return Err(SftpError::InvalidHandle);
        };
        file.write_all_at(&data, offset)?;
    }
    call.send_ok()
}

/// v4 stat requests may carry a trailing attribute-flags word.
fn skip_stat_flags(call: &mut Call<'_>) -> Result<()> {
    if call.protocol.version >= 4 && call.args.remaining() >= 4 {
        call.args.decode_u32()?;
    }
    Ok(())
}

pub fn sftp_lstat(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    skip_stat_flags(call)?;
    let md = fs::symlink_metadata(&path)?;
    call.send_attrs(&FileAttrs::from_metadata(&md))
}

pub fn sftp_stat(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    skip_stat_flags(call)?;
    let md = fs::metadata(&path)?;
    call.send_attrs(&FileAttrs::from_metadata(&md))
}

pub fn sftp_fstat(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    skip_stat_flags(call)?;
    let object = call.session.handles().get(&handle)?;
    let md = match &*object.lock() {
        HandleObject::File { file, .. } => file.metadata()?,
        HandleObject::Dir { path, .. } => fs::metadata(path)?,
    };
    call.send_attrs(&FileAttrs::from_metadata(&md))
}

pub fn sftp_setstat(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let attrs = call.attrs()?;
    attrs.apply_to_path(&path)?;
    call.send_ok()
}

pub fn sftp_fsetstat(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    let attrs = call.attrs()?;
    let object = call.session.handles().get(&handle)?;
    match &*object.lock() {
        HandleObject::File { file, .. } => attrs.apply_to_file(file)?,
        HandleObject::Dir { path, .. } => attrs.apply_to_path(path)?,
    }
    call.send_ok()
}

pub fn sftp_opendir(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let entries = fs::read_dir(&path)?;
    let handle = call
        .session
        .handles()
        .insert(HandleObject::Dir { path, entries });
    call.send_handle(&handle)
}

pub fn sftp_readdir(call: &mut Call<'_>) -> Result<()> {
    let handle = call.handle()?;
    let batch = call.session.config().readdir_batch;
    let object = call.session.handles().get(&handle)?;
    let mut names = Vec::new();
    {
        let mut guard = object.lock();
        let HandleObject::Dir { entries, .. } = &mut *guard else {
            return Err(SftpError::InvalidHandle);
        };
        while names.len() < batch {
            let Some(entry) = entries.next() else { break };
            let entry = entry?;
            // Entries can vanish between listing and lstat.
            let md = match entry.path().symlink_metadata() {
                Ok(md) => md,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let filename = call.worker.encode_name(&entry.file_name())?;
            names.push(NameEntry {
                longname: longname(&filename, &md),
                attrs: FileAttrs::from_metadata(&md),
                filename,
            });
        }
    }
    if names.is_empty() {
        return Err(SftpError::Eof);
    }
    call.send_names(&names)
}

pub fn sftp_remove(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    fs::remove_file(&path)?;
    call.send_ok()
}

pub fn sftp_mkdir(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let attrs = call.attrs()?;
    DirBuilder::new()
        .mode(attrs.permissions.map(|p| p & 0o7777).unwrap_or(0o777))
        .create(&path)?;
    call.send_ok()
}

pub fn sftp_rmdir(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    fs::remove_dir(&path)?;
    call.send_ok()
}

/// Makes `path` absolute against `cwd` and resolves `.` and `..` lexically.
pub fn normalize_path(cwd: &Path, path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in cwd.join(path).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

pub fn sftp_realpath(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let cwd = std::env::current_dir()?;
    let resolved = normalize_path(&cwd, &path);
    let filename = call.worker.encode_name(resolved.as_os_str())?;
    call.send_names(&[NameEntry {
        longname: filename.clone(),
        filename,
        attrs: FileAttrs::default(),
    }])
}

/// Renames without replacing an existing target.
pub fn sftp_rename(call: &mut Call<'_>) -> Result<()> {
    let from = call.path()?;
    let to = call.path()?;
    match fs::hard_link(&from, &to) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(&from) {
                let _ = fs::remove_file(&to);
                return Err(e.into());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e.into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e.into()),
        // Directories and cross-device moves cannot be hard linked.
        Err(_) => {
            if fs::symlink_metadata(&to).is_ok() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists).into());
            }
            fs::rename(&from, &to)?;
        }
    }
    call.send_ok()
}

pub fn sftp_readlink(call: &mut Call<'_>) -> Result<()> {
    let path = call.path()?;
    let target = fs::read_link(&path)?;
    let filename = call.worker.encode_name(target.as_os_str())?;
    call.send_names(&[NameEntry {
        longname: filename.clone(),
        filename,
        attrs: FileAttrs::default(),
    }])
}

pub fn sftp_symlink(call: &mut Call<'_>) -> Result<()> {
    let link = call.path()?;
    let target = call.path()?;
    std::os::unix::fs::symlink(&target, &link)?;
    call.send_ok()
}
