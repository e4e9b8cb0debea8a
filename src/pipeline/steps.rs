//! In-process gradient-table steps. These only reshape text tables;
//! all image processing happens in external tools.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::fs::Fs;

pub const MERGED_BVALS: &str = "merged.bvals";
pub const MERGED_BVECS: &str = "merged.bvecs";
pub const MERGED_INDEX: &str = "merged.index";
pub const ACQ_PARAMS: &str = "b0_acq.txt";
pub const ROTATED_BVECS: &str = "rotated.bvecs";

/// Files written by [`preproc`], plus the merged-series indices of every b0 volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Preproc {
    pub merged_bvals: PathBuf,
    pub merged_bvecs: PathBuf,
    pub merged_index: PathBuf,
    pub acq_file: PathBuf,
    pub b0_indices: Vec<usize>,
}

/// Merge per-run gradient tables and build eddy's index and acquisition-parameter files.
///
/// A volume is a b0 iff its b-value is `<= b0_threshold`. Each b0 volume contributes one
/// acquisition-parameter row (its run's phase-encoding direction and the readout time).
/// Each volume's index points at the most recent b0 row of its run.
pub fn preproc(
    fs: &Fs,
    bval_files: &[PathBuf],
    bvec_files: &[PathBuf],
    phase_encoding: &[String],
    readout: f64,
    b0_threshold: f64,
    out_dir: &Path,
) -> Result<Preproc> {
    if bval_files.len() != bvec_files.len() || bval_files.len() != phase_encoding.len() {
        bail!(
            "got {} b-value tables, {} b-vector tables, and {} phase-encoding directions",
            bval_files.len(),
            bvec_files.len(),
            phase_encoding.len()
        );
    }

    let mut strbuf = String::with_capacity(4096);
    let mut bvals: Vec<f64> = Vec::new();
    let mut bvecs: Vec<[f64; 3]> = Vec::new();
    let mut indices: Vec<usize> = Vec::new();
    let mut acqparams: Vec<[i32; 3]> = Vec::new();
    let mut b0_indices: Vec<usize> = Vec::new();

    for ((bval_file, bvec_file), pe) in bval_files.iter().zip(bvec_files).zip(phase_encoding) {
        fs.read_to_buf(bval_file, &mut strbuf)
            .with_context(|| format!("while reading {:?}", bval_file))?;
        let vals: Vec<f64> = parse_table(&strbuf)
            .with_context(|| format!("while parsing {:?}", bval_file))?
            .into_iter()
            .flatten()
            .collect();
        if vals.is_empty() {
            bail!("b-value table {:?} is empty", bval_file);
        }

        let direction = encoding_vector(pe)?;
        let offset = acqparams.len();
        let mut seen_b0 = 0;
        for (i, &val) in vals.iter().enumerate() {
            if val <= b0_threshold {
                seen_b0 += 1;
                b0_indices.push(bvals.len() + i);
                acqparams.push(direction);
            }
            indices.push(offset + seen_b0);
        }
        bvals.extend_from_slice(&vals);

        fs.read_to_buf(bvec_file, &mut strbuf)
            .with_context(|| format!("while reading {:?}", bvec_file))?;
        let run_bvecs = parse_vectors(&strbuf)
            .with_context(|| format!("while parsing {:?}", bvec_file))?;
        if run_bvecs.len() != vals.len() {
            bail!(
                "{:?} has {} vectors but {:?} has {} b-values",
                bvec_file,
                run_bvecs.len(),
                bval_file,
                vals.len()
            );
        }
        bvecs.extend(run_bvecs);
    }

    let out = Preproc {
        merged_bvals: out_dir.join(MERGED_BVALS),
        merged_bvecs: out_dir.join(MERGED_BVECS),
        merged_index: out_dir.join(MERGED_INDEX),
        acq_file: out_dir.join(ACQ_PARAMS),
        b0_indices,
    };

    strbuf.clear();
    for val in &bvals {
        writeln!(strbuf, "{val:.1}")?;
    }
    fs.write_file(&out.merged_bvals, &strbuf)?;

    write_vectors(fs, &out.merged_bvecs, &bvecs, &mut strbuf)?;

    strbuf.clear();
    for index in &indices {
        writeln!(strbuf, "{index}")?;
    }
    fs.write_file(&out.merged_index, &strbuf)?;

    // readout is kept to 4 decimals, then printed with 6:
    let readout = (readout * 1e4).round() / 1e4;
    strbuf.clear();
    for [x, y, z] in &acqparams {
        writeln!(strbuf, "{x} {y} {z} {readout:.6}")?;
    }
    fs.write_file(&out.acq_file, &strbuf)?;

    Ok(out)
}

/// Acquisition-parameter direction for a BIDS phase-encoding direction.
fn encoding_vector(pe: &str) -> Result<[i32; 3]> {
    let v = match pe {
        "i" => [-1, 0, 0],
        "i-" => [1, 0, 0],
        "j" => [0, -1, 0],
        "j-" => [0, 1, 0],
        "k" => [0, 0, -1],
        "k-" => [0, 0, 1],
        other => bail!("unsupported phase-encoding direction {other:?}"),
    };
    Ok(v)
}

type Matrix = [[f64; 3]; 3];

fn mul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn transpose(m: &Matrix) -> Matrix {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in m.iter().enumerate() {
        for (j, &val) in row.iter().enumerate() {
            out[j][i] = val;
        }
    }
    out
}

/// Inverse of the rotation eddy applied for one volume, from its
/// rotation parameters (radians about x, y, z).
fn inverse_rotation(rx: f64, ry: f64, rz: f64) -> Matrix {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();
    let x = [[1.0, 0.0, 0.0], [0.0, cx, sx], [0.0, -sx, cx]];
    let y = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
    let z = [[cz, sz, 0.0], [-sz, cz, 0.0], [0.0, 0.0, 1.0]];
    // orthogonal, so the inverse is the transpose:
    transpose(&mul(&x, &mul(&y, &z)))
}

/// Rotate each b-vector by the inverse of eddy's estimated rotation for that volume.
/// `par_file` rows are eddy's per-volume parameters; columns 3..6 are the rotations.
pub fn rotate_bvecs(fs: &Fs, bvec_file: &Path, par_file: &Path, out_dir: &Path) -> Result<PathBuf> {
    let mut strbuf = String::with_capacity(4096);
    fs.read_to_buf(bvec_file, &mut strbuf)
        .with_context(|| format!("while reading {:?}", bvec_file))?;
    let bvecs = vector_rows(&parse_table(&strbuf)?)?;

    fs.read_to_buf(par_file, &mut strbuf)
        .with_context(|| format!("while reading {:?}", par_file))?;
    let pars = parse_table(&strbuf)?;
    if pars.len() != bvecs.len() {
        bail!(
            "{:?} has {} rows but there are {} b-vectors",
            par_file,
            pars.len(),
            bvecs.len()
        );
    }

    let mut rotated = Vec::with_capacity(bvecs.len());
    for (row, (v, par)) in bvecs.iter().zip(&pars).enumerate() {
        if par.len() < 6 {
            bail!("{:?} row {row} has {} columns, expected at least 6", par_file, par.len());
        }
        let r = inverse_rotation(par[3], par[4], par[5]);
        let mut out = [0.0; 3];
        for (i, val) in out.iter_mut().enumerate() {
            *val = (0..3).map(|k| r[i][k] * v[k]).sum();
        }
        rotated.push(out);
    }

    let path = out_dir.join(ROTATED_BVECS);
    write_vectors(fs, &path, &rotated, &mut strbuf)?;
    Ok(path)
}

/// Render the TRACULA config template into `out_dir/config_<subject>`.
pub fn write_tracula_config(
    fs: &Fs,
    template_path: &Path,
    subs: &template::Substitutions,
    subject: &str,
    out_dir: &Path,
) -> Result<PathBuf> {
    let text = template::render_file(template_path, subs)?;
    let path = out_dir.join(format!("config_{subject}"));
    fs.write_file(&path, &text)?;
    Ok(path)
}

/// Whitespace-separated numeric rows; blank lines are ignored.
fn parse_table(text: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|s| s.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .with_context(|| format!("on line {}", lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Read raw b-vectors stored either as 3 rows (FSL layout) or one row per volume.
/// A 3x3 table is taken to be in FSL layout.
fn parse_vectors(text: &str) -> Result<Vec<[f64; 3]>> {
    let rows = parse_table(text)?;
    if rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len()) {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }
    vector_rows(&rows)
}

/// One b-vector per row, as written by `write_vectors`.
fn vector_rows(rows: &[Vec<f64>]) -> Result<Vec<[f64; 3]>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| match row.as_slice() {
            [x, y, z] => Ok([*x, *y, *z]),
            _ => bail!("b-vector row {} has {} values, expected 3", i + 1, row.len()),
        })
        .collect()
}

fn write_vectors(fs: &Fs, path: &Path, vectors: &[[f64; 3]], strbuf: &mut String) -> Result<()> {
    strbuf.clear();
    for v in vectors {
        // no "-0.0000000000" in the output:
        let [x, y, z] = v.map(|c| c + 0.0);
        writeln!(strbuf, "{x:.10} {y:.10} {z:.10}")?;
    }
    fs.write_file(path, strbuf)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, text: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        fs::write(&path, text)?;
        Ok(path)
    }

    #[test]
    fn test_preproc_tables() -> Result<()> {
        let dir = tempdir()?;
        let bvals = vec![
            write(dir.path(), "a.bval", "0 1000 5 1000\n")?,
            write(dir.path(), "b.bval", "0 2000\n")?,
        ];
        let bvecs = vec![
            write(dir.path(), "a.bvec", "0 1 0 0\n0 0 0 1\n0 0 0 0\n")?,
            write(dir.path(), "b.bvec", "0 0 0\n1 0 0\n")?,
        ];
        let pe = vec!["j".to_owned(), "j-".to_owned()];
        let fs = Fs::new([dir.path()]);

        let out = preproc(&fs, &bvals, &bvecs, &pe, 0.04799, 10.0, dir.path())?;
        assert_eq!(out.b0_indices, vec![0, 2, 4]);
        assert_eq!(
            fs::read_to_string(&out.merged_bvals)?,
            "0.0\n1000.0\n5.0\n1000.0\n0.0\n2000.0\n"
        );
        assert_eq!(fs::read_to_string(&out.merged_index)?, "1\n1\n2\n2\n3\n3\n");
        assert_eq!(
            fs::read_to_string(&out.acq_file)?,
            "0 -1 0 0.048000\n0 -1 0 0.048000\n0 1 0 0.048000\n"
        );
        let merged_bvecs = fs::read_to_string(&out.merged_bvecs)?;
        let lines: Vec<&str> = merged_bvecs.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[1], "1.0000000000 0.0000000000 0.0000000000");
        assert_eq!(lines[5], "1.0000000000 0.0000000000 0.0000000000");
        Ok(())
    }

    #[test]
    fn test_preproc_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let bvals = vec![write(dir.path(), "a.bval", "0 1000 1000\n")?];
        let bvecs = vec![write(dir.path(), "a.bvec", "0 0.6 0\n0 0.8 1\n0 0 0\n")?];
        let pe = vec!["j".to_owned()];
        let fs = Fs::new([dir.path()]);

        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::create_dir(&first)?;
        fs::create_dir(&second)?;
        let a = preproc(&fs, &bvals, &bvecs, &pe, 0.05, 10.0, &first)?;
        let b = preproc(&fs, &bvals, &bvecs, &pe, 0.05, 10.0, &second)?;
        for (x, y) in [
            (&a.merged_bvals, &b.merged_bvals),
            (&a.merged_bvecs, &b.merged_bvecs),
            (&a.merged_index, &b.merged_index),
            (&a.acq_file, &b.acq_file),
        ] {
            assert_eq!(fs::read(x)?, fs::read(y)?);
        }
        Ok(())
    }

    #[test]
    fn test_preproc_rejects_unknown_direction() -> Result<()> {
        let dir = tempdir()?;
        let bvals = vec![write(dir.path(), "a.bval", "0\n")?];
        let bvecs = vec![write(dir.path(), "a.bvec", "0\n0\n0\n")?];
        let fs = Fs::new([dir.path()]);
        let e = preproc(&fs, &bvals, &bvecs, &["x".to_owned()], 0.05, 10.0, dir.path());
        assert!(e.is_err());
        Ok(())
    }

    #[test]
    fn test_rotate_bvecs() -> Result<()> {
        let dir = tempdir()?;
        let bvecs = write(dir.path(), "merged.bvecs", "1 0 0\n1 0 0\n0 1 0\n")?;
        let half_pi = std::f64::consts::FRAC_PI_2;
        let pars = write(
            dir.path(),
            "eddy.eddy_parameters",
            &format!(
                "0.1 0.2 0.3 0 0 0 9 9\n0 0 0 0 0 {half_pi} 9 9\n0 0 0 {half_pi} 0 0 9 9\n"
            ),
        )?;
        let fs = Fs::new([dir.path()]);
        let out = rotate_bvecs(&fs, &bvecs, &pars, dir.path())?;
        let text = fs::read_to_string(out)?;
        let lines: Vec<&str> = text.lines().collect();
        // no rotation leaves the vector alone:
        assert_eq!(lines[0], "1.0000000000 0.0000000000 0.0000000000");
        // inverse of a quarter turn about z takes x to y:
        assert_eq!(lines[1], "0.0000000000 1.0000000000 0.0000000000");
        // inverse of a quarter turn about x takes y to z:
        assert_eq!(lines[2], "0.0000000000 0.0000000000 1.0000000000");
        Ok(())
    }

    #[test]
    fn test_rotate_row_mismatch() -> Result<()> {
        let dir = tempdir()?;
        let bvecs = write(dir.path(), "merged.bvecs", "1 0 0\n1 0 0\n")?;
        let pars = write(dir.path(), "p", "0 0 0 0 0 0\n")?;
        let fs = Fs::new([dir.path()]);
        assert!(rotate_bvecs(&fs, &bvecs, &pars, dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_tracula_config() -> Result<()> {
        let dir = tempdir()?;
        let tpl = write(dir.path(), "tracula_config", "set subjlist = ({subjects})\nset bveclist = ({bvec})\n")?;
        let subs: template::Substitutions =
            [("subjects", "sub-01"), ("bvec", "/w/rotated.bvecs")].into_iter().collect();
        let fs = Fs::new([dir.path()]);
        let out = write_tracula_config(&fs, &tpl, &subs, "sub-01", dir.path())?;
        assert!(out.ends_with("config_sub-01"));
        assert_eq!(
            fs::read_to_string(out)?,
            "set subjlist = (sub-01)\nset bveclist = (/w/rotated.bvecs)\n"
        );
        Ok(())
    }
}
