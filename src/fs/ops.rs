use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use util::PathEncodingError;

use super::Error;

/// Copy `src` to `tgt`, recursively if needed. Symlinks are copied as links.
fn copy(src: &Path, tgt: &Path) -> Result<()> {
    if src.is_symlink() {
        let link_tgt = fs::read_link(src)?;
        symlink(&link_tgt, tgt)?;
    } else if src.is_file() {
        fs::copy(src, tgt)?;
    } else if src.is_dir() {
        cp_dir(src, tgt, src, tgt)?;
    } else {
        return Err(
            Error::UnknownPathType(src.to_str().ok_or(PathEncodingError)?.to_owned()).into(),
        );
    }
    Ok(())
}

fn cp_dir(src_root: &Path, tgt_root: &Path, src: &Path, tgt: &Path) -> Result<()> {
    fs::create_dir_all(tgt)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_entry = entry.path();
        let tgt_entry = tgt.join(entry.file_name());
        if ty.is_symlink() {
            let orig_link_tgt = fs::read_link(&src_entry)?;
            let new_link_tgt = resolve_new_link_tgt(src_root, tgt_root, orig_link_tgt)?;
            symlink(&new_link_tgt, &tgt_entry)?;
        } else if ty.is_dir() {
            cp_dir(src_root, tgt_root, &src_entry, &tgt_entry)?;
        } else if ty.is_file() {
            fs::copy(&src_entry, &tgt_entry)?;
        } else {
            return Err(Error::UnknownPathType(
                entry.path().to_str().ok_or(PathEncodingError)?.to_owned(),
            )
            .into());
        }
    }
    Ok(())
}

/// If link is internal to `src_root`, create a new internal link in `tgt_root`.
/// O/w, just link to the same external target.
fn resolve_new_link_tgt(
    src_root: &Path,
    tgt_root: &Path,
    orig_link_tgt: PathBuf,
) -> Result<PathBuf> {
    if orig_link_tgt.starts_with(src_root) {
        Ok(tgt_root.join(orig_link_tgt.strip_prefix(src_root)?))
    } else {
        Ok(orig_link_tgt)
    }
}

/// Hard-link `src` to `tgt`, falling back to a copy. Directories are copied recursively.
/// An existing `tgt` is replaced.
pub fn link_or_copy(src: &Path, tgt: &Path) -> Result<()> {
    if tgt.is_symlink() || tgt.is_file() {
        fs::remove_file(tgt)?;
    } else if tgt.is_dir() {
        fs::remove_dir_all(tgt)?;
    }
    if src.is_file() && !src.is_symlink() {
        if let Err(e) = fs::hard_link(src, tgt) {
            log::debug!("hard link {:?} -> {:?} failed ({e}), copying instead", src, tgt);
            fs::copy(src, tgt)?;
        }
        Ok(())
    } else {
        copy(src, tgt)
    }
}

/// Symlink the given `link` to `tgt`; works for unix and windows.
fn symlink(tgt: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    std::os::unix::fs::symlink(tgt, link)?;

    #[cfg(windows)]
    if tgt.is_dir() {
        std::os::windows::fs::link_dir(tgt, link)?;
    } else {
        std::os::windows::fs::link_file(tgt, link)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_link_or_copy_replaces_existing() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("rotated.bvecs");
        fs::write(&src, "0.0 0.0 1.0\n")?;
        let tgt = dir.path().join("published.bvecs");
        fs::write(&tgt, "stale")?;

        link_or_copy(&src, &tgt)?;
        assert_eq!(fs::read_to_string(&tgt)?, "0.0 0.0 1.0\n");

        let src_dir = dir.path().join("dmri.bedpostX");
        fs::create_dir(&src_dir)?;
        fs::write(src_dir.join("dyads2.nii.gz"), "gz")?;
        let tgt_dir = dir.path().join("out/dmri.bedpostX");
        fs::create_dir_all(dir.path().join("out"))?;
        link_or_copy(&src_dir, &tgt_dir)?;
        assert!(tgt_dir.join("dyads2.nii.gz").is_file());
        Ok(())
    }

    #[test]
    fn test_copy_dir_rewrites_internal_links() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("trac/sub-01/dmri");
        let mask_dir = src.join("masks");
        fs::create_dir_all(&mask_dir)?;
        let mask = mask_dir.join("brain_mask.nii.gz");
        fs::write(&mask, "mask")?;
        symlink(&mask, &src.join("nodif_brain_mask.nii.gz"))?;
        symlink(Path::new("/dev/null"), &src.join("lowb"))?;

        let tgt = dir.path().join("out/sub-01/dmri");
        copy(&src, &tgt)?;

        assert_eq!(fs::read_to_string(tgt.join("masks/brain_mask.nii.gz"))?, "mask");
        let internal = tgt.join("nodif_brain_mask.nii.gz");
        assert!(internal.is_symlink());
        assert_eq!(fs::read_link(&internal)?, tgt.join("masks/brain_mask.nii.gz"));
        assert_eq!(fs::read_link(tgt.join("lowb"))?, PathBuf::from("/dev/null"));
        Ok(())
    }
}
