use crate::error::{Error, Result};
use crate::job::JobSpec;
use crate::task::DISTANCE_REMOTE;

/// Checks the structural preconditions of a submitted job graph.
///
/// Stages reference their upstreams by index and may only point backwards,
/// so a valid spec is a DAG in topological order.
pub fn validate_job_spec(spec: &JobSpec) -> Result<()> {
    if spec.stages.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "job {:?} has no stages",
            spec.name
        )));
    }
    if spec.config.max_task_attempts == 0 {
        return Err(Error::InvalidArgument(
            "max_task_attempts must be at least 1".to_string(),
        ));
    }
    if spec.config.max_data_distance > DISTANCE_REMOTE {
        return Err(Error::InvalidArgument(format!(
            "max_data_distance {} out of range (0..={DISTANCE_REMOTE})",
            spec.config.max_data_distance
        )));
    }

    for (idx, stage) in spec.stages.iter().enumerate() {
        if stage.tasks.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "stage {idx} ({}) has no tasks",
                stage.name
            )));
        }
        for &dep in &stage.depends_on {
            if dep >= idx {
                return Err(Error::InvalidArgument(format!(
                    "stage {idx} ({}) depends on stage {dep}, which is not an earlier stage",
                    stage.name
                )));
            }
        }
        if !stage.data_input && stage.depends_on.is_empty() && idx > 0 {
            // channel-only stage with no producer would never get input
            return Err(Error::InvalidArgument(format!(
                "stage {idx} ({}) reads channels but has no upstream stage",
                stage.name
            )));
        }
    }
    Ok(())
}

/// Stages that list `stage` among their upstreams.
pub fn downstream_of(spec: &JobSpec, stage: usize) -> Vec<usize> {
    spec.stages
        .iter()
        .enumerate()
        .filter(|(_, s)| s.depends_on.contains(&stage))
        .map(|(idx, _)| idx)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{SchedulingConfig, StageSpec};
    use crate::task::TaskSpec;

    fn stage(name: &str, data_input: bool, depends_on: Vec<usize>) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            data_input,
            depends_on,
            tasks: vec![TaskSpec::default()],
        }
    }

    fn job(stages: Vec<StageSpec>) -> JobSpec {
        JobSpec {
            name: "wordcount".to_string(),
            config: SchedulingConfig::default(),
            stages,
        }
    }

    #[test]
    fn accepts_map_reduce_shape() {
        let spec = job(vec![stage("map", true, vec![]), stage("reduce", false, vec![0])]);
        validate_job_spec(&spec).unwrap();
        assert_eq!(downstream_of(&spec, 0), vec![1]);
        assert!(downstream_of(&spec, 1).is_empty());
    }

    #[test]
    fn rejects_forward_and_self_edges() {
        let forward = job(vec![stage("a", true, vec![1]), stage("b", false, vec![0])]);
        assert!(matches!(
            validate_job_spec(&forward),
            Err(Error::InvalidArgument(_))
        ));

        let self_edge = job(vec![stage("a", true, vec![]), stage("b", false, vec![1])]);
        assert!(validate_job_spec(&self_edge).is_err());
    }

    #[test]
    fn rejects_empty_shapes() {
        assert!(validate_job_spec(&job(vec![])).is_err());

        let mut empty_stage = stage("a", true, vec![]);
        empty_stage.tasks.clear();
        assert!(validate_job_spec(&job(vec![empty_stage])).is_err());
    }
}
