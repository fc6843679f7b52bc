//! Translate a `tar` crate entry into the Guard's [`MemberHeader`].

use std::io::Read;

use bstr::BString;
use tar::{Entry, EntryType};

use crate::error::ExtractError;
use crate::guard::{MemberHeader, MemberType};

fn classify(entry_type: EntryType) -> MemberType {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => MemberType::Reg,
        EntryType::Directory => MemberType::Dir,
        EntryType::Symlink => MemberType::Symlink,
        EntryType::Link => MemberType::Hardlink,
        EntryType::GNUSparse => MemberType::Sparse,
        EntryType::Char => MemberType::CharDev,
        EntryType::Block => MemberType::BlockDev,
        EntryType::Fifo => MemberType::Fifo,
        _ => MemberType::Unknown,
    }
}

/// Build a [`MemberHeader`] from one `tar` crate entry. GNU long-name
/// continuation and PAX `path`/`linkpath` overrides are already resolved by
/// `entry.path()`/`entry.link_name()` at this point.
pub fn member_header<R: Read>(entry: &mut Entry<'_, R>) -> Result<MemberHeader, ExtractError> {
    let header = entry.header();
    let raw_path = entry.path_bytes();
    let path = entry.path().map_err(|e| ExtractError::MalformedArchive {
        detail: format!("invalid member path: {e}"),
    })?;
    let name = path.to_string_lossy().into_owned();

    let link_target = entry
        .link_name_bytes()
        .map(|cow| String::from_utf8_lossy(&cow).into_owned());

    let size = header.size().unwrap_or(0);
    let pax_size = entry
        .pax_extensions()
        .ok()
        .flatten()
        .and_then(|mut exts| {
            exts.find_map(|ext| {
                let ext = ext.ok()?;
                if ext.key().ok()? == "size" {
                    std::str::from_utf8(ext.value_bytes()).ok()?.parse::<u64>().ok()
                } else {
                    None
                }
            })
        });

    Ok(MemberHeader {
        raw_name: BString::from(raw_path.into_owned()),
        name,
        member_type: classify(header.entry_type()),
        size,
        mode: header.mode().unwrap_or(0o644),
        uid: header.uid().unwrap_or(0) as u32,
        gid: header.gid().unwrap_or(0) as u32,
        mtime: header.mtime().unwrap_or(0) as i64,
        link_target,
        pax_size,
    })
}
