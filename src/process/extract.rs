use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};
use zip::{result::ZipError, ZipArchive};

use crate::error::{Error, Result};

fn corrupt(archive: &Path, reason: impl ToString) -> Error {
    Error::CorruptArchive {
        archive: archive.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Extract the named members of a ZIP archive into `dest_dir`, creating it
/// if needed. Returns the extracted paths in the order requested.
///
/// Every name is checked before anything is written, so a missing member
/// leaves `dest_dir` untouched.
#[instrument(level = "debug", skip_all, fields(archive = %archive_path.as_ref().display()))]
pub fn extract<P: AsRef<Path>, S: AsRef<str>>(
    archive_path: P,
    members: &[S],
    dest_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let archive_path = archive_path.as_ref();
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| corrupt(archive_path, e))?;

    for m in members {
        let name = m.as_ref();
        if !archive.file_names().any(|n| n == name) {
            return Err(Error::MemberNotFound {
                archive: archive_path.to_path_buf(),
                member: name.to_string(),
            });
        }
    }

    fs::create_dir_all(dest_dir)?;
    let mut out = Vec::with_capacity(members.len());
    for m in members {
        let name = m.as_ref();
        let mut entry = archive.by_name(name).map_err(|e| match e {
            ZipError::FileNotFound => Error::MemberNotFound {
                archive: archive_path.to_path_buf(),
                member: name.to_string(),
            },
            other => corrupt(archive_path, other),
        })?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| corrupt(archive_path, format!("unsafe member path {:?}", name)))?;
        let target = dest_dir.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut f = File::create(&target)?;
        if let Err(e) = io::copy(&mut entry, &mut f) {
            drop(f);
            let _ = fs::remove_file(&target);
            return Err(corrupt(archive_path, format!("reading {}: {}", name, e)));
        }
        debug!(member = name, to = %target.display(), "extracted");
        out.push(target);
    }

    Ok(out)
}

/// Extract `member` from one release's archive into `scratch` and rename it
/// to `<release>_<member>`, so the same member from every release can sit
/// side by side.
pub fn stage_release<P: AsRef<Path>>(
    archive_path: P,
    release: &str,
    member: &str,
    scratch: &Path,
) -> Result<PathBuf> {
    let extracted = extract(archive_path, &[member], scratch)?;
    let from = &extracted[0];
    let base = from
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| member.to_string());
    let staged = scratch.join(format!("{}_{}", release, base));
    fs::rename(from, &staged)?;
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    fn write_zip(path: &Path, members: &[(&str, &str)]) -> anyhow::Result<()> {
        let mut zip = zip::ZipWriter::new(File::create(path)?);
        for (name, body) in members {
            let options: FileOptions<'_, ()> =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            zip.start_file(*name, options)?;
            zip.write_all(body.as_bytes())?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn extracts_one_or_many_members() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let archive = tmp.path().join("2019q3_rr1.zip");
        write_zip(&archive, &[("sub.tsv", "adsh\n1\n"), ("tag.tsv", "tag\tversion\n")])?;

        let dest = tmp.path().join("out");
        let got = extract(&archive, &["sub.tsv"], &dest)?;
        assert_eq!(got, [dest.join("sub.tsv")]);
        assert_eq!(fs::read_to_string(&got[0])?, "adsh\n1\n");

        let dest2 = tmp.path().join("out2");
        let got = extract(&archive, &["tag.tsv", "sub.tsv"], &dest2)?;
        assert_eq!(got, [dest2.join("tag.tsv"), dest2.join("sub.tsv")]);
        Ok(())
    }

    #[test]
    fn missing_member_writes_nothing() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let archive = tmp.path().join("2019q3_rr1.zip");
        write_zip(&archive, &[("sub.tsv", "adsh\n")])?;
        let dest = tmp.path().join("out");

        let err = extract(&archive, &["sub.tsv", "txt.tsv"], &dest).unwrap_err();
        assert!(matches!(err, Error::MemberNotFound { ref member, .. } if member == "txt.tsv"));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn garbage_is_a_corrupt_archive() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let archive = tmp.path().join("2019q3_rr1.zip");
        fs::write(&archive, b"<html>rate limited</html>")?;
        let err = extract(&archive, &["sub.tsv"], tmp.path()).unwrap_err();
        assert!(matches!(err, Error::CorruptArchive { .. }));
        Ok(())
    }

    #[test]
    fn staging_prefixes_the_release() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let scratch = tmp.path().join("scratch");
        for release in ["2019q3_rr1", "2019q4_rr1"] {
            let archive = tmp.path().join(format!("{}.zip", release));
            write_zip(&archive, &[("tag.tsv", release)])?;
            let staged = stage_release(&archive, release, "tag.tsv", &scratch)?;
            assert_eq!(staged, scratch.join(format!("{}_tag.tsv", release)));
        }
        let mut names: Vec<_> = fs::read_dir(&scratch)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        assert_eq!(names, ["2019q3_rr1_tag.tsv", "2019q4_rr1_tag.tsv"]);
        assert_eq!(fs::read_to_string(scratch.join("2019q3_rr1_tag.tsv"))?, "2019q3_rr1");
        Ok(())
    }
}
