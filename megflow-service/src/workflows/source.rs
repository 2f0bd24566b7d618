// Source Workflow
// datasource -> concat_event -> inv_solution -> morph_stc

use super::SUBJECT_AXIS;
use crate::config::PipelineConfig;
use crate::error::ServiceResult;
use crate::execution::{DependencyGraph, UnitOfWork};
use crate::resolver::PathTemplate;
use crate::units::{
    ConcatenateEvents, DataGrabber, EventParams, InverseSolution, MorphSourceEstimate,
};

use std::path::PathBuf;

pub const DATASOURCE: &str = "datasource";
pub const CONCAT_EVENT: &str = "concat_event";
pub const INV_SOLUTION: &str = "inv_solution";
pub const MORPH_STC: &str = "morph_stc";

/// Graph and work root of the source reconstruction workflow
///
/// Event extraction, raw concatenation, inverse and morph have no portable
/// command line, so each needs a `routines` entry.
pub fn build(config: &PipelineConfig) -> ServiceResult<(DependencyGraph, PathBuf)> {
    let inverse = config.require_inverse()?;
    let name = config.source_workflow_name()?;
    let routines = &config.routines;
    let extract = config.require_routine("extract_events", &routines.extract_events)?;
    let concat = config.require_routine("concat_raw", &routines.concat_raw)?;
    let solver = config.require_routine("inverse", &routines.inverse)?;
    let morph = config.require_routine("morph", &routines.morph)?;

    let data_root = &config.paths.data_root;
    let subjects_dir = &config.paths.subjects_dir;
    let runs = PathTemplate::new(
        data_root.join(&config.events.runs_root),
        config.events.runs_template.as_str(),
    );

    let mut graph = DependencyGraph::new(name.as_str());
    graph.add_unit(UnitOfWork::new(DATASOURCE, DataGrabber::multiple(runs)))?;
    graph.add_unit(UnitOfWork::new(
        CONCAT_EVENT,
        ConcatenateEvents::new(
            EventParams::from(&config.events),
            extract.clone(),
            concat.clone(),
        ),
    ))?;
    graph.add_unit(UnitOfWork::new(
        INV_SOLUTION,
        InverseSolution::new(inverse.clone(), subjects_dir, solver.clone()),
    ))?;
    graph.add_unit(
        UnitOfWork::new(
            MORPH_STC,
            MorphSourceEstimate::new(inverse, config.morph.clone(), subjects_dir, morph.clone()),
        )
        .published(),
    )?;

    graph.bind_axis(CONCAT_EVENT, "subject", SUBJECT_AXIS)?;
    graph.connect(DATASOURCE, DataGrabber::OUTPUT, CONCAT_EVENT, "runs")?;

    graph.bind_axis(INV_SOLUTION, "subject", SUBJECT_AXIS)?;
    graph.connect(CONCAT_EVENT, "raw_file", INV_SOLUTION, "raw_file")?;
    graph.connect(CONCAT_EVENT, "event_file", INV_SOLUTION, "event_file")?;

    graph.bind_axis(MORPH_STC, "subject", SUBJECT_AXIS)?;
    graph.connect(INV_SOLUTION, "stc_files", MORPH_STC, "stc_files")?;

    Ok((graph, data_root.join(name)))
}

/// External programs configured for the source workflow
pub fn programs(config: &PipelineConfig) -> Vec<String> {
    let routines = &config.routines;
    [
        &routines.extract_events,
        &routines.concat_raw,
        &routines.inverse,
        &routines.morph,
    ]
    .into_iter()
    .flatten()
    .map(|command| command.program.clone())
    .collect()
}
