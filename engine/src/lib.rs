//! Stage registry and CLI argument helpers.

use pipeline_core::PipelineController;

/// Static registry: stage number to executor, all six stages.
pub fn build_controller() -> PipelineController {
    let mut controller = PipelineController::new();
    controller.register(Box::new(tle_ingest::Stage1Executor));
    controller.register(Box::new(orbital_propagation::Stage2Executor));
    controller.register(Box::new(coordinate_frames::Stage3Executor));
    controller.register(Box::new(link_analysis::Stage4Executor));
    controller.register(Box::new(signal_analysis::Stage5Executor));
    controller.register(Box::new(handover_events::Stage6Executor));
    controller
}

/// Parse `--stages`: `A-B` for a contiguous range, `A,B,C` for an
/// enumerated list. Stages must be 1-6 and strictly increasing.
pub fn parse_stage_list(spec: &str) -> Result<Vec<u8>, String> {
    let stages: Vec<u8> = if let Some((a, b)) = spec.split_once('-') {
        let start: u8 = a
            .trim()
            .parse()
            .map_err(|_| format!("bad stage number {a:?}"))?;
        let end: u8 = b
            .trim()
            .parse()
            .map_err(|_| format!("bad stage number {b:?}"))?;
        if start > end {
            return Err(format!("empty stage range {spec:?}"));
        }
        (start..=end).collect()
    } else {
        spec.split(',')
            .map(|s| {
                s.trim()
                    .parse::<u8>()
                    .map_err(|_| format!("bad stage number {s:?}"))
            })
            .collect::<Result<_, _>>()?
    };

    if stages.is_empty() {
        return Err("empty stage list".to_string());
    }
    if stages.iter().any(|&s| !(1..=6).contains(&s)) {
        return Err(format!("stages out of range 1-6 in {spec:?}"));
    }
    if stages.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("stages must be strictly increasing in {spec:?}"));
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contiguous_range() {
        assert_eq!(parse_stage_list("2-4").unwrap(), vec![2, 3, 4]);
        assert_eq!(parse_stage_list("1-1").unwrap(), vec![1]);
    }

    #[test]
    fn test_parse_enumerated_list() {
        assert_eq!(parse_stage_list("2,3,5").unwrap(), vec![2, 3, 5]);
        assert_eq!(parse_stage_list("4").unwrap(), vec![4]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_stage_list("0-3").is_err());
        assert!(parse_stage_list("7").is_err());
        assert!(parse_stage_list("3-2").is_err());
        assert!(parse_stage_list("2,2").is_err());
        assert!(parse_stage_list("").is_err());
    }

    #[test]
    fn test_registry_covers_all_six_stages() {
        let controller = build_controller();
        assert_eq!(controller.registered_stages(), vec![1, 2, 3, 4, 5, 6]);
    }
}
