//! File attribute structures for SFTP v3 and v4

use std::fs::{self, File, Metadata, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use chrono::{DateTime, Utc};
use filetime::FileTime;

use crate::codec::{SftpDecoder, SftpEncoder};
use crate::error::{Result, SftpError};

pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x0000_0001;
/// v3 only
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x0000_0004;
/// v3 only: atime and mtime together
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x0000_0008;
/// v4: same bit as ACMODTIME, atime alone
pub const SSH_FILEXFER_ATTR_ACCESSTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_CREATETIME: u32 = 0x0000_0010;
pub const SSH_FILEXFER_ATTR_MODIFYTIME: u32 = 0x0000_0020;
pub const SSH_FILEXFER_ATTR_ACL: u32 = 0x0000_0040;
pub const SSH_FILEXFER_ATTR_OWNERGROUP: u32 = 0x0000_0080;
pub const SSH_FILEXFER_ATTR_SUBSECOND_TIMES: u32 = 0x0000_0100;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x8000_0000;

pub const SSH_FILEXFER_TYPE_REGULAR: u8 = 1;
pub const SSH_FILEXFER_TYPE_DIRECTORY: u8 = 2;
pub const SSH_FILEXFER_TYPE_SYMLINK: u8 = 3;
pub const SSH_FILEXFER_TYPE_SPECIAL: u8 = 4;
pub const SSH_FILEXFER_TYPE_UNKNOWN: u8 = 5;

const V3_KNOWN: u32 = 0x0000_000F | SSH_FILEXFER_ATTR_EXTENDED;
const V4_KNOWN: u32 = 0x0000_01FD | SSH_FILEXFER_ATTR_EXTENDED;

/// Attributes carried in ATTRS, NAME, OPEN, MKDIR and SETSTAT messages.
///
/// Absent fields are `None` and are neither sent nor applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    /// v4 file type byte
    pub file_type: u8,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

impl Default for FileAttrs {
    fn default() -> Self {
        Self {
            file_type: SSH_FILEXFER_TYPE_UNKNOWN,
            size: None,
            uid: None,
            gid: None,
            permissions: None,
            atime: None,
            mtime: None,
        }
    }
}

impl FileAttrs {
    /// Attributes describing `md`.
    pub fn from_metadata(md: &Metadata) -> Self {
        let ft = md.file_type();
        let file_type = if ft.is_file() {
            SSH_FILEXFER_TYPE_REGULAR
        } else if ft.is_dir() {
            SSH_FILEXFER_TYPE_DIRECTORY
        } else if ft.is_symlink() {
            SSH_FILEXFER_TYPE_SYMLINK
        } else {
            SSH_FILEXFER_TYPE_SPECIAL
        };
        Self {
            file_type,
            size: Some(md.size()),
            uid: Some(md.uid()),
            gid: Some(md.gid()),
            permissions: Some(md.mode()),
            atime: Some(md.atime()),
            mtime: Some(md.mtime()),
        }
    }

    /// Encodes the attributes in the layout of protocol `version`.
    pub fn encode(&self, version: u32, enc: &mut SftpEncoder) {
        if version <= 3 {
            self.encode_v3(enc)
        } else {
            self.encode_v4(enc)
        }
    }

    fn encode_v3(&self, enc: &mut SftpEncoder) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        enc.encode_u32(flags);
        if let Some(size) = self.size {
            enc.encode_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            enc.encode_u32(uid);
            enc.encode_u32(gid);
        }
        if let Some(perms) = self.permissions {
            enc.encode_u32(perms);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            enc.encode_u32(atime as u32);
            enc.encode_u32(mtime as u32);
        }
    }

    fn encode_v4(&self, enc: &mut SftpEncoder) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_OWNERGROUP;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACCESSTIME;
        }
        if self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_MODIFYTIME;
        }
        enc.encode_u32(flags);
        enc.encode_u8(self.file_type);
        if let Some(size) = self.size {
            enc.encode_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            enc.encode_string(&uid.to_string());
            enc.encode_string(&gid.to_string());
        }
        if let Some(perms) = self.permissions {
            enc.encode_u32(perms & 0o7777);
        }
        if let Some(atime) = self.atime {
            enc.encode_u64(atime as u64);
        }
        if let Some(mtime) = self.mtime {
            enc.encode_u64(mtime as u64);
        }
    }

    /// Decodes attributes in the layout of protocol `version`.
    pub fn decode(version: u32, dec: &mut SftpDecoder) -> Result<Self> {
        if version <= 3 {
            Self::decode_v3(dec)
        } else {
            Self::decode_v4(dec)
        }
    }

    fn decode_v3(dec: &mut SftpDecoder) -> Result<Self> {
        let flags = dec.decode_u32()?;
        if flags & !V3_KNOWN != 0 {
            return Err(SftpError::Unsupported {
                reason: format!("attribute flags {:#x}", flags & !V3_KNOWN),
            });
        }
        let mut attrs = FileAttrs::default();
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(dec.decode_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = Some(dec.decode_u32()?);
            attrs.gid = Some(dec.decode_u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(dec.decode_u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(dec.decode_u32()? as i64);
            attrs.mtime = Some(dec.decode_u32()? as i64);
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            skip_extended(dec)?;
        }
        Ok(attrs)
    }

    fn decode_v4(dec: &mut SftpDecoder) -> Result<Self> {
        let flags = dec.decode_u32()?;
        if flags & !V4_KNOWN != 0 {
            return Err(SftpError::Unsupported {
                reason: format!("attribute flags {:#x}", flags & !V4_KNOWN),
            });
        }
        let subsecond = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;
        let mut attrs = FileAttrs {
            file_type: dec.decode_u8()?,
            ..Default::default()
        };
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(dec.decode_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
            attrs.uid = Some(parse_numeric_owner(&dec.decode_string()?)?);
            attrs.gid = Some(parse_numeric_owner(&dec.decode_string()?)?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(dec.decode_u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
            attrs.atime = Some(decode_time_v4(dec, subsecond)?);
        }
        if flags & SSH_FILEXFER_ATTR_CREATETIME != 0 {
            // Creation time cannot be set on POSIX filesystems.
            decode_time_v4(dec, subsecond)?;
        }
        if flags & SSH_FILEXFER_ATTR_MODIFYTIME != 0 {
            attrs.mtime = Some(decode_time_v4(dec, subsecond)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACL != 0 {
            return Err(SftpError::Unsupported {
                reason: "ACLs".to_string(),
            });
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            skip_extended(dec)?;
        }
        Ok(attrs)
    }

    /// Applies the present fields to the file at `path` (following symlinks).
    pub fn apply_to_path(&self, path: &Path) -> Result<()> {
        if let Some(size) = self.size {
            fs::OpenOptions::new().write(true).open(path)?.set_len(size)?;
        }
        if self.uid.is_some() || self.gid.is_some() {
            std::os::unix::fs::chown(path, self.uid, self.gid)?;
        }
        if let Some(perms) = self.permissions {
            fs::set_permissions(path, Permissions::from_mode(perms & 0o7777))?;
        }
        if let Some(atime) = self.atime {
            filetime::set_file_atime(path, FileTime::from_unix_time(atime, 0))?;
        }
        if let Some(mtime) = self.mtime {
            filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))?;
        }
        Ok(())
    }

    /// Applies the present fields to an open file.
    pub fn apply_to_file(&self, file: &File) -> Result<()> {
        if let Some(size) = self.size {
            file.set_len(size)?;
        }
        if self.uid.is_some() || self.gid.is_some() {
            std::os::unix::fs::fchown(file, self.uid, self.gid)?;
        }
        if let Some(perms) = self.permissions {
            file.set_permissions(Permissions::from_mode(perms & 0o7777))?;
        }
        if self.atime.is_some() || self.mtime.is_some() {
            filetime::set_file_handle_times(
                file,
                self.atime.map(|t| FileTime::from_unix_time(t, 0)),
                self.mtime.map(|t| FileTime::from_unix_time(t, 0)),
            )?;
        }
        Ok(())
    }
}

fn decode_time_v4(dec: &mut SftpDecoder, subsecond: bool) -> Result<i64> {
    let secs = dec.decode_u64()? as i64;
    if subsecond {
        dec.decode_u32()?;
    }
    Ok(secs)
}

fn parse_numeric_owner(name: &str) -> Result<u32> {
    name.parse().map_err(|_| SftpError::Unsupported {
        reason: format!("non-numeric owner or group {:?}", name),
    })
}

fn skip_extended(dec: &mut SftpDecoder) -> Result<()> {
    let count = dec.decode_u32()?;
    for _ in 0..count {
        dec.decode_bytes()?;
        dec.decode_bytes()?;
    }
    Ok(())
}

/// `ls -l` style line used as the v3 longname.
pub fn longname(name: &str, md: &Metadata) -> String {
    let mtime = DateTime::<Utc>::from_timestamp(md.mtime(), 0)
        .map(|t| t.format("%b %e %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} {:>3} {:<8} {:<8} {:>8} {} {}",
        mode_string(md.mode()),
        md.nlink(),
        md.uid(),
        md.gid(),
        md.size(),
        mtime,
        name
    )
}

fn mode_string(mode: u32) -> String {
    let kind = match mode & libc::S_IFMT {
        libc::S_IFDIR => 'd',
        libc::S_IFLNK => 'l',
        libc::S_IFCHR => 'c',
        libc::S_IFBLK => 'b',
        libc::S_IFIFO => 'p',
        libc::S_IFSOCK => 's',
        _ => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        s.push(match (mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    s
}
