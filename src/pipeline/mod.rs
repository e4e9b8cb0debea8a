//! The fixed per-subject processing graph:
//!
//! ```text
//! preproc ─┬───────────────────────────────┬──────────────┐
//! merge ───┼─ b0_select ─ topup ─ mask ─ eddy ─ rotate ─ trac_config ─ trac_prep ─┬─ bedpost ─ trac_path
//!          │                                                                     ├─ tensor ─┐
//!          │                                                                     └─ recon ──┴─ track
//!          └───────────────────────────── sinker (collects from preproc, rotate, eddy, tensor, recon, track)
//! ```
//!
//! Every node of one subject's graph carries that subject's id, and only constants
//! taken from its [`SubjectContext`] feed it. Graphs for different subjects share nothing.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use graph::{Bindings, CommandTask, FunctionTask, Graph, OutputFile, ResourceHints, TaskNode, Value, ValueType};

use crate::fs::{Fs, ResultSink};
use crate::prep::SubjectContext;

/// Gradient-table glue run in-process.
pub mod steps;

/// Eddy's fixed resources.
const EDDY_THREADS: usize = 4;
const EDDY_MEMORY_GB: usize = 10;

/// Which model `recon` fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Recon {
    /// constrained spherical deconvolution
    Csd,
    /// constant solid angle
    Csa,
}

impl Recon {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csd => "csd",
            Self::Csa => "csa",
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::Csd => "dipy_fit_csd",
            Self::Csa => "dipy_fit_csa",
        }
    }
}

/// Pipeline-wide choices that aren't per subject.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub recon: Recon,
    /// threads given to the reconstruction steps
    pub threads: usize,
    /// highest b-value still counted as a b0 volume
    pub b0_threshold: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            recon: Recon::Csd,
            threads: 4,
            b0_threshold: 10.0,
        }
    }
}

/// `(sinker input port, output container)`. An empty container is the subject root.
const SINK_PORTS: [(&str, &str); 8] = [
    ("bvec_file", "pre"),
    ("bval_file", ""),
    ("rot_bvec_file", ""),
    ("out_file", ""),
    ("fa", "recon"),
    ("evec", "recon"),
    ("gfa", "recon"),
    ("track", "recon"),
];

/// Outputs of `trac_prep` every reconstruction step reads, in argument order.
const DWI_PORTS: [&str; 4] = ["dwi_file", "bvals", "bvecs", "mask_file"];

fn arg(path: &Path) -> Result<String> {
    Ok(util::path_str(path)?.to_owned())
}

fn dwi_args(inputs: &Bindings) -> Result<Vec<String>> {
    DWI_PORTS.iter().map(|port| arg(inputs.file(port)?)).collect()
}

/// Build one subject's graph.
pub fn build_subject_graph(
    ctx: &SubjectContext,
    opts: &PipelineOptions,
    fs: &Fs,
    sink: &ResultSink,
) -> Result<Graph, graph::Error> {
    let sid = ctx.subject.as_str();
    let recon = opts.recon.as_str();
    let tsd = ctx.tracula_subject_dir();
    let mut g = Graph::new();
    log::debug!("{sid}: building graph, publishing to {:?}", ctx.out_dir);

    // gradient tables //

    let preproc = {
        let fs = fs.clone();
        TaskNode::function(
            sid,
            "preproc",
            FunctionTask::new(move |inputs, work_dir| {
                let out = steps::preproc(
                    &fs,
                    inputs.files("bval_files")?,
                    inputs.files("bvec_files")?,
                    inputs.scalars("phase_encoding")?,
                    inputs.parse("readout")?,
                    inputs.parse("b0_threshold")?,
                    work_dir,
                )?;
                let b0_indices: Vec<String> = out.b0_indices.iter().map(usize::to_string).collect();
                Ok(Bindings::new()
                    .with("merged_bvals", out.merged_bvals)
                    .with("merged_bvecs", out.merged_bvecs)
                    .with("merged_index", out.merged_index)
                    .with("acq_file", out.acq_file)
                    .with("b0_indices", b0_indices))
            }),
        )
        .constant("bval_files", ctx.bvals.clone())
        .constant("bvec_files", ctx.bvecs.clone())
        .constant("phase_encoding", ctx.phase_encoding.clone())
        .constant("readout", Value::scalar(ctx.readout))
        .constant("b0_threshold", Value::scalar(opts.b0_threshold))
        .output("merged_bvals", ValueType::File)
        .output("merged_bvecs", ValueType::File)
        .output("merged_index", ValueType::File)
        .output("acq_file", ValueType::File)
        .output("b0_indices", ValueType::ScalarList)
    };
    let preproc = g.add_node(preproc)?;

    // distortion correction //

    let merge = CommandTask::new("fslmerge", |inputs| {
        let mut args = vec!["-t".to_owned(), "merged.nii.gz".to_owned()];
        for f in inputs.files("in_files")? {
            args.push(arg(f)?);
        }
        Ok(args)
    })
    .output("merged_file", OutputFile::WorkDir("merged.nii.gz".into()));
    let merge = g.add_node(TaskNode::command(sid, "merge", merge).constant("in_files", ctx.dwis.clone()))?;

    let b0_select = CommandTask::new("fslselectvols", |inputs| {
        Ok(vec![
            "-i".to_owned(),
            arg(inputs.file("in_file")?)?,
            "-o".to_owned(),
            "b0_merged.nii.gz".to_owned(),
            format!("--vols={}", inputs.scalars("b0_indices")?.join(",")),
        ])
    })
    .output("b0_file", OutputFile::WorkDir("b0_merged.nii.gz".into()));
    let b0_select = g.add_node(
        TaskNode::command(sid, "b0_select", b0_select)
            .input("in_file", ValueType::File)
            .input("b0_indices", ValueType::ScalarList),
    )?;
    g.connect(merge, "merged_file", b0_select, "in_file")?;
    g.connect(preproc, "b0_indices", b0_select, "b0_indices")?;

    let topup = CommandTask::new("topup", |inputs| {
        Ok(vec![
            format!("--imain={}", arg(inputs.file("in_file")?)?),
            format!("--datain={}", arg(inputs.file("encoding_file")?)?),
            "--config=b02b0.cnf".to_owned(),
            "--out=topup".to_owned(),
            "--iout=b0correct.nii.gz".to_owned(),
            "--numprec=float".to_owned(),
        ])
    })
    .output("out_corrected", OutputFile::WorkDir("b0correct.nii.gz".into()))
    .output("out_fieldcoef", OutputFile::WorkDir("topup_fieldcoef.nii.gz".into()))
    .output("out_movpar", OutputFile::WorkDir("topup_movpar.txt".into()));
    let topup = g.add_node(
        TaskNode::command(sid, "topup", topup)
            .input("in_file", ValueType::File)
            .input("encoding_file", ValueType::File),
    )?;
    g.connect(b0_select, "b0_file", topup, "in_file")?;
    g.connect(preproc, "acq_file", topup, "encoding_file")?;

    let mask = CommandTask::new("bet", |inputs| {
        Ok(vec![
            arg(inputs.file("in_file")?)?,
            "b0correct_brain".to_owned(),
            "-m".to_owned(),
        ])
    })
    .output("mask_file", OutputFile::WorkDir("b0correct_brain_mask.nii.gz".into()));
    let mask = g.add_node(TaskNode::command(sid, "mask", mask).input("in_file", ValueType::File))?;
    g.connect(topup, "out_corrected", mask, "in_file")?;

    let eddy = CommandTask::new("eddy_openmp", |inputs| {
        let fieldcoef = arg(inputs.file("in_topup_fieldcoef")?)?;
        let topup_base = fieldcoef
            .strip_suffix("_fieldcoef.nii.gz")
            .ok_or_else(|| anyhow!("unexpected topup field coefficient name {fieldcoef:?}"))?;
        Ok(vec![
            format!("--imain={}", arg(inputs.file("in_file")?)?),
            format!("--mask={}", arg(inputs.file("in_mask")?)?),
            format!("--acqp={}", arg(inputs.file("in_acqp")?)?),
            format!("--index={}", arg(inputs.file("in_index")?)?),
            format!("--bvecs={}", arg(inputs.file("in_bvec")?)?),
            format!("--bvals={}", arg(inputs.file("in_bval")?)?),
            format!("--topup={topup_base}"),
            "--out=eddy_corrected".to_owned(),
        ])
    })
    .output("out_corrected", OutputFile::WorkDir("eddy_corrected.nii.gz".into()))
    .output(
        "out_parameter",
        OutputFile::WorkDir("eddy_corrected.eddy_parameters".into()),
    );
    let eddy_ports = [
        ("in_file", merge, "merged_file"),
        ("in_mask", mask, "mask_file"),
        ("in_acqp", preproc, "acq_file"),
        ("in_index", preproc, "merged_index"),
        ("in_bvec", preproc, "merged_bvecs"),
        ("in_bval", preproc, "merged_bvals"),
        ("in_topup_fieldcoef", topup, "out_fieldcoef"),
        ("in_topup_movpar", topup, "out_movpar"),
    ];
    let mut eddy = TaskNode::command(sid, "eddy", eddy).hints(
        ResourceHints::default()
            .threads(EDDY_THREADS)
            .memory_gb(EDDY_MEMORY_GB),
    );
    for (port, _, _) in &eddy_ports {
        eddy = eddy.input(*port, ValueType::File);
    }
    let eddy = g.add_node(eddy)?;
    for (port, src, src_port) in eddy_ports {
        g.connect(src, src_port, eddy, port)?;
    }

    let rotate = {
        let fs = fs.clone();
        TaskNode::function(
            sid,
            "rotate",
            FunctionTask::new(move |inputs, work_dir| {
                let out = steps::rotate_bvecs(
                    &fs,
                    inputs.file("bvec_file")?,
                    inputs.file("par_file")?,
                    work_dir,
                )?;
                Ok(Bindings::new().with("bvec_file", out))
            }),
        )
        .input("bvec_file", ValueType::File)
        .input("par_file", ValueType::File)
        .output("bvec_file", ValueType::File)
    };
    let rotate = g.add_node(rotate)?;
    g.connect(preproc, "merged_bvecs", rotate, "bvec_file")?;
    g.connect(eddy, "out_parameter", rotate, "par_file")?;

    // TRACULA //

    let trac_config = {
        let fs = fs.clone();
        TaskNode::function(
            sid,
            "trac_config",
            FunctionTask::new(move |inputs, work_dir| {
                let subject = inputs.scalar("subjects")?;
                let mut subs = template::Substitutions::new();
                subs.insert("subjects", subject)
                    .insert("dtroot", arg(inputs.file("dtroot")?)?)
                    .insert("niftis", arg(inputs.file("nifti")?)?)
                    .insert("bval", arg(inputs.file("bval")?)?)
                    .insert("bvec", arg(inputs.file("bvec")?)?);
                let config = steps::write_tracula_config(
                    &fs,
                    inputs.file("template")?,
                    &subs,
                    subject,
                    work_dir,
                )?;
                Ok(Bindings::new().with("config_file", config))
            }),
        )
        .constant("template", ctx.tracula_config.clone())
        .constant("subjects", sid)
        .constant("dtroot", ctx.dtroot())
        .input("nifti", ValueType::File)
        .input("bval", ValueType::File)
        .input("bvec", ValueType::File)
        .output("config_file", ValueType::File)
    };
    let trac_config = g.add_node(trac_config)?;
    g.connect(eddy, "out_corrected", trac_config, "nifti")?;
    g.connect(preproc, "merged_bvals", trac_config, "bval")?;
    g.connect(rotate, "bvec_file", trac_config, "bvec")?;

    let dmri = tsd.join("dmri");
    let trac_prep = CommandTask::new("trac-all", |inputs| {
        Ok(vec![
            "-prep".to_owned(),
            "-c".to_owned(),
            arg(inputs.file("config_file")?)?,
            "-no-isrunning".to_owned(),
            "-noqa".to_owned(),
        ])
    })
    .output("dwi_file", OutputFile::Absolute(dmri.join("dwi.nii.gz")))
    .output("bvals", OutputFile::Absolute(dmri.join("bvals")))
    .output("bvecs", OutputFile::Absolute(dmri.join("bvecs")))
    .output(
        "mask_file",
        OutputFile::Absolute(tsd.join("dlabel/diff/aparc+aseg_mask.bbr.nii.gz")),
    );
    let trac_prep = g.add_node(TaskNode::command(sid, "trac_prep", trac_prep).input("config_file", ValueType::File))?;
    g.connect(trac_config, "config_file", trac_prep, "config_file")?;

    let bedpost_dir = tsd.join("dmri.bedpostX");
    let bedpost = CommandTask::new("bedpostx_gpu", |inputs| {
        let dwi = inputs.file("dwi_file")?;
        let dmri = dwi
            .parent()
            .ok_or_else(|| anyhow!("{:?} has no parent directory", dwi))?;
        Ok(vec![
            arg(dmri)?,
            "-NJOBS".to_owned(),
            "1".to_owned(),
            "--model=2".to_owned(),
            "--rician".to_owned(),
        ])
    })
    .clear_before_run(bedpost_dir.clone())
    .output("bedpost_file", OutputFile::Absolute(bedpost_dir.join("dyads2.nii.gz")));
    let bedpost = g.add_node(
        TaskNode::command(sid, "bedpost", bedpost)
            .input("dwi_file", ValueType::File)
            .hints(ResourceHints::default().extra("--gres=gpu:1")),
    )?;
    g.connect(trac_prep, "dwi_file", bedpost, "dwi_file")?;

    let trac_path = CommandTask::new("trac-all", |inputs| {
        Ok(vec![
            "-path".to_owned(),
            "-c".to_owned(),
            arg(inputs.file("config_file")?)?,
            "-no-isrunning".to_owned(),
        ])
    })
    .output("path_dir", OutputFile::Absolute(tsd.join("dpath")));
    let trac_path = g.add_node(
        TaskNode::command(sid, "trac_path", trac_path)
            .input("config_file", ValueType::File)
            .input("bedpost_file", ValueType::File),
    )?;
    g.connect(trac_config, "config_file", trac_path, "config_file")?;
    g.connect(bedpost, "bedpost_file", trac_path, "bedpost_file")?;

    // reconstruction //

    let recon_hints = ResourceHints::default()
        .threads(opts.threads)
        .memory_gb(3 * opts.threads);

    let fa_name = format!("{sid}_tensor_fa.nii.gz");
    let evec_name = format!("{sid}_tensor_evec.nii.gz");
    let tensor = {
        let (fa_arg, evec_arg) = (fa_name.clone(), evec_name.clone());
        CommandTask::new("dipy_fit_dti", move |inputs| {
            let mut args = dwi_args(inputs)?;
            args.extend(
                [
                    "--save_metrics",
                    "fa",
                    "evec",
                    "--out_dir",
                    ".",
                    "--out_fa",
                    fa_arg.as_str(),
                    "--out_evec",
                    evec_arg.as_str(),
                ]
                .map(str::to_owned),
            );
            Ok(args)
        })
        .output("tensor_fa_file", OutputFile::WorkDir(fa_name.clone().into()))
        .output("tensor_evec_file", OutputFile::WorkDir(evec_name.clone().into()))
    };
    let mut tensor = TaskNode::command(sid, "tensor", tensor).hints(recon_hints.clone());
    for port in DWI_PORTS {
        tensor = tensor.input(port, ValueType::File);
    }
    let tensor = g.add_node(tensor)?;

    let pam_name = format!("{sid}_{recon}_peaks.pam5");
    let gfa_name = format!("{sid}_{recon}_gfa.nii.gz");
    let model = {
        let (pam_arg, gfa_arg, which) = (pam_name.clone(), gfa_name.clone(), opts.recon);
        CommandTask::new(opts.recon.program(), move |inputs| {
            let mut args = dwi_args(inputs)?;
            match which {
                Recon::Csd => args.extend(["--roi_radii", "10", "--fa_thr", "0.7"].map(str::to_owned)),
                Recon::Csa => args.extend(["--sh_order", "4"].map(str::to_owned)),
            }
            args.extend(
                ["--out_dir", ".", "--out_pam", pam_arg.as_str(), "--out_gfa", gfa_arg.as_str()].map(str::to_owned),
            );
            Ok(args)
        })
        .output("peaks_file", OutputFile::WorkDir(pam_name.clone().into()))
        .output("model_gfa_file", OutputFile::WorkDir(gfa_name.clone().into()))
    };
    let mut model = TaskNode::command(sid, "recon", model).hints(recon_hints.clone());
    for port in DWI_PORTS {
        model = model.input(port, ValueType::File);
    }
    let model = g.add_node(model)?;
    for port in DWI_PORTS {
        g.connect(trac_prep, port, tensor, port)?;
        g.connect(trac_prep, port, model, port)?;
    }

    let track_name = format!("{sid}_{recon}_streamline.trk");
    let track = {
        let track_arg = track_name.clone();
        CommandTask::new("dipy_track", move |inputs| {
            Ok(vec![
                arg(inputs.file("peaks_file")?)?,
                arg(inputs.file("stopping_file")?)?,
                arg(inputs.file("seeding_file")?)?,
                "--stopping_thr".to_owned(),
                "0.1".to_owned(),
                "--out_dir".to_owned(),
                ".".to_owned(),
                "--out_tractogram".to_owned(),
                track_arg.clone(),
            ])
        })
        .output("model_track_file", OutputFile::WorkDir(track_name.into()))
    };
    let track = g.add_node(
        TaskNode::command(sid, "track", track)
            .input("peaks_file", ValueType::File)
            .input("stopping_file", ValueType::File)
            .input("seeding_file", ValueType::File)
            .hints(recon_hints),
    )?;
    g.connect(model, "peaks_file", track, "peaks_file")?;
    // CSD tracks along FA; CSA along its own GFA:
    match opts.recon {
        Recon::Csd => g.connect(tensor, "tensor_fa_file", track, "stopping_file")?,
        Recon::Csa => g.connect(model, "model_gfa_file", track, "stopping_file")?,
    }
    g.connect(trac_prep, "mask_file", track, "seeding_file")?;

    // outputs //

    let sinker = {
        let sink = sink.clone();
        let subject = sid.to_owned();
        let mut node = TaskNode::function(
            sid,
            "sinker",
            FunctionTask::new(move |inputs, _| {
                let mut items = Vec::with_capacity(SINK_PORTS.len());
                for (port, container) in SINK_PORTS {
                    let value = inputs
                        .get(port)
                        .ok_or_else(|| anyhow!("sink input \"{port}\" is unbound"))?;
                    items.push((container, value));
                }
                let published = sink.publish_all(&subject, items)?;
                Ok(Bindings::new().with("published", published))
            }),
        )
        .output("published", ValueType::FileList);
        for (port, _) in SINK_PORTS {
            node = node.input(port, ValueType::File);
        }
        node
    };
    let sinker = g.add_node(sinker)?;
    let sink_sources = [
        (preproc, "merged_bvecs"),
        (preproc, "merged_bvals"),
        (rotate, "bvec_file"),
        (eddy, "out_corrected"),
        (tensor, "tensor_fa_file"),
        (tensor, "tensor_evec_file"),
        (model, "model_gfa_file"),
        (track, "model_track_file"),
    ];
    for ((src, src_port), (port, _)) in sink_sources.into_iter().zip(SINK_PORTS) {
        g.connect(src, src_port, sinker, port)?;
    }

    g.validate()?;
    Ok(g)
}

/// Build and merge the graphs of every subject, in the order given.
pub fn build_meta_graph(
    contexts: &[SubjectContext],
    opts: &PipelineOptions,
    fs: &Fs,
    sink: &ResultSink,
) -> Result<Graph, graph::Error> {
    let mut meta = Graph::new();
    for ctx in contexts {
        meta = meta.merge(build_subject_graph(ctx, opts, fs, sink)?)?;
    }
    meta.validate()?;
    Ok(meta)
}

/// Paths the pipeline writes outside the working and output roots.
pub fn tool_output_dirs(contexts: &[SubjectContext]) -> Vec<PathBuf> {
    contexts.iter().map(|ctx| ctx.tracula_dir.clone()).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prep::Acquisition;
    use graph::NodeState;
    use traverse::Traversal;

    fn context(subject: &str) -> SubjectContext {
        let acq = Acquisition {
            subject: subject.to_owned(),
            dwis: vec![PathBuf::from(format!("/data/{subject}/dwi/{subject}_dwi.nii.gz"))],
            bvals: vec![PathBuf::from(format!("/data/{subject}/dwi/{subject}_dwi.bval"))],
            bvecs: vec![PathBuf::from(format!("/data/{subject}/dwi/{subject}_dwi.bvec"))],
            phase_encoding: vec!["j".to_owned()],
            readout: 0.05,
        };
        SubjectContext::new(
            acq,
            Path::new("/cfg/tracula_config"),
            Path::new("/trac"),
            Path::new("/out"),
        )
    }

    fn sink() -> ResultSink {
        ResultSink::new(Path::new("/out"), Fs::new(["/out"]))
    }

    #[test]
    fn test_subject_graph_shape() -> anyhow::Result<()> {
        let g = build_subject_graph(
            &context("sub-01"),
            &PipelineOptions::default(),
            &Fs::new(["/w"]),
            &sink(),
        )?;
        assert_eq!(g.len(), 15);
        let names: Vec<&str> = g.nodes().map(|(_, n)| n.step()).collect();
        assert!(names.contains(&"trac_path"));

        let id = |name: &str| g.find(name).ok_or_else(|| anyhow!("no node {name}"));
        let mut deps: Vec<&str> = g
            .dependencies(id("sub-01.eddy")?)
            .into_iter()
            .map(|d| g.node(d).step())
            .collect();
        deps.sort();
        assert_eq!(deps, vec!["mask", "merge", "preproc", "topup"]);

        let track_deps = g.dependencies(id("sub-01.track")?);
        assert!(track_deps.contains(&id("sub-01.tensor")?));

        let eddy = g.node(id("sub-01.eddy")?);
        assert_eq!(eddy.resource_hints().threads, Some(4));
        assert_eq!(eddy.resource_hints().memory_gb, Some(10));
        let recon = g.node(id("sub-01.recon")?);
        assert_eq!(recon.resource_hints().memory_gb, Some(12));
        Ok(())
    }

    #[test]
    fn test_csa_tracks_along_gfa() -> anyhow::Result<()> {
        let opts = PipelineOptions {
            recon: Recon::Csa,
            ..PipelineOptions::default()
        };
        let g = build_subject_graph(&context("sub-01"), &opts, &Fs::new(["/w"]), &sink())?;
        let track = g.find("sub-01.track").ok_or_else(|| anyhow!("no track"))?;
        let tensor = g.find("sub-01.tensor").ok_or_else(|| anyhow!("no tensor"))?;
        assert!(!g.dependencies(track).contains(&tensor));
        Ok(())
    }

    #[test]
    fn test_meta_graph_keeps_subjects_apart() -> anyhow::Result<()> {
        let contexts = [context("sub-01"), context("sub-02")];
        let g = build_meta_graph(&contexts, &PipelineOptions::default(), &Fs::new(["/w"]), &sink())?;
        assert_eq!(g.len(), 30);
        assert_eq!(g.subjects(), vec!["sub-01", "sub-02"]);
        for edge in g.edges() {
            assert_eq!(g.node(edge.src).subject(), g.node(edge.dst).subject());
        }

        // only the two preproc and two merge nodes can start:
        let t = Traversal::new(&g)?;
        let mut ready: Vec<&str> = t
            .states()
            .filter(|(_, s)| *s == NodeState::Ready)
            .map(|(id, _)| g.node(id).name())
            .collect();
        ready.sort();
        assert_eq!(
            ready,
            vec!["sub-01.merge", "sub-01.preproc", "sub-02.merge", "sub-02.preproc"]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_subject_rejected() {
        let contexts = [context("sub-01"), context("sub-01")];
        let e = build_meta_graph(&contexts, &PipelineOptions::default(), &Fs::new(["/w"]), &sink()).unwrap_err();
        assert!(matches!(e, graph::Error::DuplicateNode(_)));
    }
}
