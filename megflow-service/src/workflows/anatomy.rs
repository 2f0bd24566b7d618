// Anatomy Workflow
// datasource -> recon_all -> call_mne_watershed_bem -> copy_bem_surf

use super::SUBJECT_AXIS;
use crate::config::PipelineConfig;
use crate::error::ServiceResult;
use crate::execution::{DependencyGraph, UnitOfWork};
use crate::resolver::PathTemplate;
use crate::units::{CopyBemSurfaces, DataGrabber, ReconAll, SlotValue, WatershedBem};

use std::path::PathBuf;

pub const DATASOURCE: &str = "datasource";
pub const RECON_ALL: &str = "recon_all";
pub const WATERSHED_BEM: &str = "call_mne_watershed_bem";
pub const COPY_BEM: &str = "copy_bem_surf";

/// Graph and work root of the anatomy workflow
pub fn build(config: &PipelineConfig) -> ServiceResult<(DependencyGraph, PathBuf)> {
    let freesurfer_home = config.require_freesurfer_home()?;
    let mri_root = config.mri_root();
    let subjects_dir = SlotValue::Path(config.paths.subjects_dir.clone());
    let routines = &config.routines;

    let mut recon = ReconAll::new(freesurfer_home);
    if let Some(command) = &routines.recon_all {
        recon = recon.with_command(command.clone());
    }
    let mut watershed = WatershedBem::new();
    if let Some(command) = &routines.watershed_bem {
        watershed = watershed.with_command(command.clone());
    }

    let mut graph = DependencyGraph::new(config.anatomy.workflow_name.as_str());
    graph.add_unit(UnitOfWork::new(
        DATASOURCE,
        DataGrabber::single(PathTemplate::new(&mri_root, config.anatomy.t1_template.as_str())),
    ))?;
    graph.add_unit(UnitOfWork::new(RECON_ALL, recon))?;
    graph.add_unit(UnitOfWork::new(WATERSHED_BEM, watershed))?;
    graph.add_unit(UnitOfWork::new(COPY_BEM, CopyBemSurfaces::new()).published())?;

    graph.bind_axis(RECON_ALL, "subject_id", SUBJECT_AXIS)?;
    graph.connect(DATASOURCE, DataGrabber::OUTPUT, RECON_ALL, "t1_file")?;
    graph.bind_literal(RECON_ALL, "subjects_dir", subjects_dir.clone())?;

    graph.connect(RECON_ALL, "subject_id", WATERSHED_BEM, "subject_id")?;
    graph.bind_literal(WATERSHED_BEM, "subjects_dir", subjects_dir.clone())?;

    graph.connect(WATERSHED_BEM, "subject_id", COPY_BEM, "subject_id")?;
    graph.bind_literal(COPY_BEM, "subjects_dir", subjects_dir)?;

    Ok((graph, mri_root.join(&config.anatomy.workflow_name)))
}

/// External programs the anatomy workflow runs
pub fn programs(config: &PipelineConfig) -> Vec<String> {
    let routines = &config.routines;
    let recon = routines
        .recon_all
        .clone()
        .unwrap_or_else(ReconAll::default_command);
    let watershed = routines
        .watershed_bem
        .clone()
        .unwrap_or_else(WatershedBem::default_command);
    vec![recon.program, watershed.program]
}
