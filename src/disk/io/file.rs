use std::{
    fs::{self, File, OpenOptions},
    io::Read,
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};

use crate::{
    error::disk::{NewTorrentError, ReadError, WriteError},
    storage_info::{FileInfo, FileSlice},
    Sha1Hash,
};

pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens the file in create, read, and write modes at the path formed
    /// by joining the download directory and the path in the file info,
    /// creating missing parent directories.
    ///
    /// The file is extended to its final length right away, so resume can
    /// tell a partially allocated file from a corrupt one by size alone.
    pub fn new(
        download_dir: &Path,
        info: FileInfo,
    ) -> Result<Self, NewTorrentError> {
        log::trace!(
            "Opening and creating file {:?} in dir {:?}",
            info.path,
            download_dir
        );
        debug_assert!(!info.attributes.padding);

        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    log::warn!("Failed to create dir {:?}", parent);
                    NewTorrentError::Io(e)
                })?;
            }
        }

        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;

        if handle.metadata()?.len() < info.len {
            handle.set_len(info.len)?;
        }

        Ok(Self { info, handle })
    }

    /// Writes the slices to the file at the slice's offset, using
    /// positional vectored IO, repeating the syscall until every byte is
    /// on its way to disk.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking; it must be
    /// executed on a blocking thread, not the async executor.
    pub fn write_vectored_at(
        &self,
        bufs: &[&[u8]],
        file_slice: FileSlice,
    ) -> Result<usize, WriteError> {
        debug_assert!(
            crate::iovecs::total_len(bufs) as u64 <= file_slice.len
        );

        let mut bufs = bufs.to_vec();
        let mut offset = file_slice.offset;
        let mut total_write_count = 0;

        // IO syscalls are not guaranteed to transfer the whole input in
        // one go, so repeat until all bytes are written or an error occurs
        while !bufs.is_empty() {
            let write_count =
                positional::pwritev(&self.handle, &bufs, offset).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        WriteError::Io(e)
                    },
                )?;
            bufs = crate::iovecs::advance(&bufs, write_count);
            offset += write_count as u64;
            total_write_count += write_count;
        }

        Ok(total_write_count)
    }

    /// Reads exactly `buf.len()` bytes from the file at the slice offset.
    ///
    /// # Important
    ///
    /// Sync IO; blocking thread only.
    pub fn read_exact_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), ReadError> {
        let mut filled = 0;
        while filled < buf.len() {
            let read_count = positional::pread(
                &self.handle,
                &mut buf[filled..],
                offset + filled as u64,
            )
            .map_err(|e| {
                log::warn!("File {:?} read error: {}", self.info.path, e);
                ReadError::Io(e)
            })?;
            if read_count == 0 {
                // the file is preallocated to its final size, so EOF here
                // means it was truncated behind our back
                return Err(ReadError::MissingData);
            }
            filled += read_count;
        }
        Ok(())
    }
}

/// Positional IO shims: `pwritev`/`pread` on unix, seek-based fallback
/// elsewhere.
mod positional {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub fn pwritev(
        file: &File,
        bufs: &[&[u8]],
        offset: u64,
    ) -> io::Result<usize> {
        use std::io::IoSlice;
        use std::os::fd::AsFd;
        let iovecs: Vec<IoSlice> =
            bufs.iter().map(|b| IoSlice::new(b)).collect();
        nix::sys::uio::pwritev(file.as_fd(), &iovecs, offset as i64)
            .map_err(io::Error::from)
    }

    #[cfg(unix)]
    pub fn pread(
        file: &File,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<usize> {
        use std::os::fd::AsFd;
        nix::sys::uio::pread(file.as_fd(), buf, offset as i64)
            .map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    pub fn pwritev(
        file: &File,
        bufs: &[&[u8]],
        offset: u64,
    ) -> io::Result<usize> {
        use std::io::{Seek, SeekFrom, Write};
        let mut handle = file;
        handle.seek(SeekFrom::Start(offset))?;
        // write only the first buffer per call; the caller's loop advances
        handle.write(bufs[0])
    }

    #[cfg(not(unix))]
    pub fn pread(
        file: &File,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut handle = file;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read(buf)
    }
}

/// Applies a file's BEP 47 attributes after its data is stable on disk.
///
/// - symlink: (re)create the link pointing at the target, which was
///   validated against directory escapes at metainfo parse time;
/// - executable: set the execute permission bits (unix only);
/// - hidden: a no-op here, the hidden attribute only exists on windows;
/// - padding files never reach this function, they are never created.
pub fn apply_attributes(
    download_dir: &Path,
    info: &FileInfo,
) -> Result<(), WriteError> {
    debug_assert!(!info.attributes.padding);
    let path = download_dir.join(&info.path);

    if let Some(target) = &info.attributes.symlink_target {
        let link_path = symlink_path(download_dir, &info.path);
        if link_path.exists() || link_path.is_symlink() {
            fs::remove_file(&link_path)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &link_path)?;
        #[cfg(not(unix))]
        log::warn!("Symlink {:?} not supported on this platform", link_path);
        log::debug!("Created symlink {:?} -> {:?}", link_path, target);
    }

    if info.attributes.executable {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            fs::set_permissions(&path, perms)?;
        }
    }

    if info.attributes.hidden {
        // only meaningful on windows; on unix hidden-ness is a name
        // convention the torrent author already chose
        #[cfg(windows)]
        log::debug!("Hidden attribute for {:?}", path);
    }

    Ok(())
}

/// A symlink entry's own path: the file's path names the link itself.
fn symlink_path(download_dir: &Path, link: &Path) -> PathBuf {
    download_dir.join(link)
}

/// Verifies a file's optional whole-file SHA-1 (BEP 47), streaming in
/// chunks to bound memory.
pub fn verify_file_sha1(
    path: &Path,
    expected: &Sha1Hash,
) -> Result<bool, ReadError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read_count = file.read(&mut buf)?;
        if read_count == 0 {
            break;
        }
        hasher.update(&buf[..read_count]);
    }
    let digest = hasher.finalize();
    Ok(digest.as_slice() == expected)
}
