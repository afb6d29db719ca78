//! Measurement-event state machines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{CandidateMeasurement, EventType, HandoverEvent, StateRecord};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventParams {
    /// A3: neighbor must beat serving by this offset, dB.
    pub a3_offset_db: f64,
    /// Entry/exit hysteresis, dB.
    pub hysteresis_db: f64,
    /// Grid steps the A3 condition must hold before entry.
    pub time_to_trigger_steps: usize,
    /// A4: absolute neighbor threshold, dBm.
    pub a4_threshold_dbm: f64,
    /// A5: serving below threshold 1, neighbor above threshold 2, dBm.
    pub a5_threshold1_dbm: f64,
    pub a5_threshold2_dbm: f64,
    /// D2: serving farther than threshold 1, neighbor closer than
    /// threshold 2, km.
    pub d2_threshold1_km: f64,
    pub d2_threshold2_km: f64,
}

impl Default for EventParams {
    fn default() -> Self {
        Self {
            a3_offset_db: 3.0,
            hysteresis_db: 1.0,
            time_to_trigger_steps: 2,
            a4_threshold_dbm: -100.0,
            a5_threshold1_dbm: -110.0,
            a5_threshold2_dbm: -100.0,
            d2_threshold1_km: 1500.0,
            d2_threshold2_km: 1200.0,
        }
    }
}

/// Per-(event, neighbor) trigger state.
#[derive(Debug, Default, Clone)]
struct TriggerState {
    consecutive: usize,
    active: bool,
    open_event: Option<usize>,
}

pub struct EventDetector {
    params: EventParams,
    events: Vec<HandoverEvent>,
    states: BTreeMap<(EventType, String), TriggerState>,
}

/// One timestamp of input to the detector.
pub struct Observation<'a> {
    pub timestamp: DateTime<Utc>,
    pub serving_id: Option<&'a str>,
    pub serving_rsrp_dbm: Option<f64>,
    pub serving_distance_km: Option<f64>,
    pub candidates: &'a [CandidateMeasurement],
}

impl EventDetector {
    pub fn new(params: EventParams) -> Self {
        Self {
            params,
            events: Vec::new(),
            states: BTreeMap::new(),
        }
    }

    /// Feed one timestamp; returns the event types active afterwards.
    pub fn observe(&mut self, obs: &Observation) -> Vec<EventType> {
        let (Some(serving_id), Some(serving_rsrp)) = (obs.serving_id, obs.serving_rsrp_dbm)
        else {
            // No serving cell: every armed trigger relaxes.
            self.release_all(obs.timestamp);
            return Vec::new();
        };

        for neighbor in obs.candidates {
            if neighbor.satellite_id == serving_id {
                continue;
            }
            let n = neighbor.rsrp_dbm;
            let hys = self.params.hysteresis_db;

            // A3: offset with hysteresis and time-to-trigger.
            let a3_enter = n > serving_rsrp + self.params.a3_offset_db + hys;
            let a3_exit = n < serving_rsrp + self.params.a3_offset_db - hys;
            self.step_timed(
                EventType::A3,
                neighbor,
                serving_id,
                serving_rsrp,
                obs,
                a3_enter,
                a3_exit,
            );

            // A4: absolute neighbor level.
            let a4_enter = n > self.params.a4_threshold_dbm + hys;
            let a4_exit = n < self.params.a4_threshold_dbm - hys;
            self.step_immediate(
                EventType::A4,
                neighbor,
                serving_id,
                serving_rsrp,
                obs,
                a4_enter,
                a4_exit,
            );

            // A5: weak serving with a strong neighbor.
            let a5_enter = serving_rsrp < self.params.a5_threshold1_dbm - hys
                && n > self.params.a5_threshold2_dbm + hys;
            let a5_exit = serving_rsrp > self.params.a5_threshold1_dbm + hys
                || n < self.params.a5_threshold2_dbm - hys;
            self.step_immediate(
                EventType::A5,
                neighbor,
                serving_id,
                serving_rsrp,
                obs,
                a5_enter,
                a5_exit,
            );

            // D2: distance geometry.
            if let Some(serving_distance) = obs.serving_distance_km {
                let d2_enter = serving_distance > self.params.d2_threshold1_km
                    && neighbor.distance_km < self.params.d2_threshold2_km;
                let d2_exit = serving_distance < self.params.d2_threshold1_km
                    || neighbor.distance_km > self.params.d2_threshold2_km;
                self.step_immediate(
                    EventType::D2,
                    neighbor,
                    serving_id,
                    serving_rsrp,
                    obs,
                    d2_enter,
                    d2_exit,
                );
            }
        }

        let mut active: Vec<EventType> = self
            .states
            .iter()
            .filter(|(_, state)| state.active)
            .map(|((event_type, _), _)| *event_type)
            .collect();
        active.dedup();
        active
    }

    /// Close every open event at end of data.
    pub fn finish(mut self, last_timestamp: DateTime<Utc>) -> Vec<HandoverEvent> {
        self.release_all(last_timestamp);
        self.events
    }

    #[allow(clippy::too_many_arguments)]
    fn step_timed(
        &mut self,
        event_type: EventType,
        neighbor: &CandidateMeasurement,
        serving_id: &str,
        serving_rsrp: f64,
        obs: &Observation,
        enter: bool,
        exit: bool,
    ) {
        let ttt = self.params.time_to_trigger_steps;
        let key = (event_type, neighbor.satellite_id.clone());
        let state = self.states.entry(key).or_default();

        if state.active {
            if exit {
                Self::close(&mut self.events, state, obs.timestamp);
            }
            return;
        }
        if enter {
            state.consecutive += 1;
            if state.consecutive >= ttt {
                Self::open(
                    &mut self.events,
                    state,
                    event_type,
                    neighbor,
                    serving_id,
                    serving_rsrp,
                    obs,
                );
            }
        } else {
            state.consecutive = 0;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_immediate(
        &mut self,
        event_type: EventType,
        neighbor: &CandidateMeasurement,
        serving_id: &str,
        serving_rsrp: f64,
        obs: &Observation,
        enter: bool,
        exit: bool,
    ) {
        let key = (event_type, neighbor.satellite_id.clone());
        let state = self.states.entry(key).or_default();
        if state.active {
            if exit {
                Self::close(&mut self.events, state, obs.timestamp);
            }
        } else if enter {
            Self::open(
                &mut self.events,
                state,
                event_type,
                neighbor,
                serving_id,
                serving_rsrp,
                obs,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        events: &mut Vec<HandoverEvent>,
        state: &mut TriggerState,
        event_type: EventType,
        neighbor: &CandidateMeasurement,
        serving_id: &str,
        serving_rsrp: f64,
        obs: &Observation,
    ) {
        state.active = true;
        state.consecutive = 0;
        state.open_event = Some(events.len());
        events.push(HandoverEvent {
            event_type,
            entry_time: obs.timestamp,
            exit_time: None,
            serving_id: serving_id.to_string(),
            neighbor_id: neighbor.satellite_id.clone(),
            serving_rsrp_dbm: serving_rsrp,
            neighbor_rsrp_dbm: neighbor.rsrp_dbm,
            serving_distance_km: obs.serving_distance_km,
            neighbor_distance_km: Some(neighbor.distance_km),
        });
    }

    fn close(events: &mut [HandoverEvent], state: &mut TriggerState, at: DateTime<Utc>) {
        if let Some(index) = state.open_event.take() {
            if let Some(event) = events.get_mut(index) {
                event.exit_time = Some(at);
            }
        }
        state.active = false;
        state.consecutive = 0;
    }

    fn release_all(&mut self, at: DateTime<Utc>) {
        for state in self.states.values_mut() {
            if state.active {
                Self::close(&mut self.events, state, at);
            }
            state.consecutive = 0;
        }
    }
}

/// Run the detector over a full timeline of state records, filling in the
/// per-record active-event flags and returning the event log.
pub fn detect(records: &mut [StateRecord], params: EventParams) -> Vec<HandoverEvent> {
    let mut detector = EventDetector::new(params);
    let mut last = None;
    for record in records.iter_mut() {
        let serving_distance_km = record.serving_id.as_deref().and_then(|id| {
            record
                .candidates
                .iter()
                .find(|c| c.satellite_id == id)
                .map(|c| c.distance_km)
        });
        let obs = Observation {
            timestamp: record.timestamp,
            serving_id: record.serving_id.as_deref(),
            serving_rsrp_dbm: record.serving_rsrp_dbm,
            serving_distance_km,
            candidates: &record.candidates,
        };
        record.active_events = detector.observe(&obs);
        last = Some(record.timestamp);
    }
    match last {
        Some(at) => detector.finish(at),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(
        i: i64,
        serving: Option<(&str, f64)>,
        candidates: &[(&str, f64, f64)],
    ) -> StateRecord {
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        StateRecord {
            timestamp: start + Duration::seconds(30 * i),
            serving_id: serving.map(|(id, _)| id.to_string()),
            serving_rsrp_dbm: serving.map(|(_, rsrp)| rsrp),
            candidates: candidates
                .iter()
                .map(|(id, rsrp, distance)| CandidateMeasurement {
                    satellite_id: id.to_string(),
                    rsrp_dbm: *rsrp,
                    distance_km: *distance,
                })
                .collect(),
            active_events: Vec::new(),
        }
    }

    #[test]
    fn test_a3_requires_time_to_trigger() {
        // Neighbor beats serving by 5 dB (offset 3 + hys 1 satisfied) but
        // only from the second sample; entry lands on the TTT-th hold.
        let mut records = vec![
            record(0, Some(("s", -100.0)), &[("s", -100.0, 800.0), ("n", -99.0, 700.0)]),
            record(1, Some(("s", -100.0)), &[("s", -100.0, 800.0), ("n", -95.0, 700.0)]),
            record(2, Some(("s", -100.0)), &[("s", -100.0, 800.0), ("n", -95.0, 700.0)]),
            record(3, Some(("s", -100.0)), &[("s", -100.0, 800.0), ("n", -95.0, 700.0)]),
        ];
        let events = detect(&mut records, EventParams::default());

        let a3: Vec<&HandoverEvent> =
            events.iter().filter(|e| e.event_type == EventType::A3).collect();
        assert_eq!(a3.len(), 1);
        assert_eq!(a3[0].neighbor_id, "n");
        assert_eq!(a3[0].entry_time, records[2].timestamp);
        assert!(records[0].active_events.is_empty());
        assert!(records[2].active_events.contains(&EventType::A3));
    }

    #[test]
    fn test_a3_hysteresis_blocks_chatter() {
        // Neighbor hovers just above the offset but inside hysteresis:
        // never enters.
        let mut records: Vec<StateRecord> = (0..6)
            .map(|i| {
                record(
                    i,
                    Some(("s", -100.0)),
                    &[("s", -100.0, 800.0), ("n", -96.5, 700.0)],
                )
            })
            .collect();
        let events = detect(&mut records, EventParams::default());
        assert!(events.iter().all(|e| e.event_type != EventType::A3));
    }

    #[test]
    fn test_a5_weak_serving_strong_neighbor() {
        let mut records = vec![
            record(0, Some(("s", -115.0)), &[("s", -115.0, 900.0), ("n", -95.0, 700.0)]),
            record(1, Some(("s", -105.0)), &[("s", -105.0, 900.0), ("n", -95.0, 700.0)]),
        ];
        let events = detect(&mut records, EventParams::default());
        let a5: Vec<&HandoverEvent> =
            events.iter().filter(|e| e.event_type == EventType::A5).collect();
        assert_eq!(a5.len(), 1);
        assert_eq!(a5[0].entry_time, records[0].timestamp);
        assert_eq!(a5[0].exit_time, Some(records[1].timestamp));
    }

    #[test]
    fn test_d2_distance_geometry() {
        let mut records = vec![
            record(0, Some(("s", -100.0)), &[("s", -100.0, 1600.0), ("n", -101.0, 1100.0)]),
            record(1, Some(("s", -100.0)), &[("s", -100.0, 1400.0), ("n", -101.0, 1100.0)]),
        ];
        let events = detect(&mut records, EventParams::default());
        let d2: Vec<&HandoverEvent> =
            events.iter().filter(|e| e.event_type == EventType::D2).collect();
        assert_eq!(d2.len(), 1);
        assert_eq!(d2[0].serving_distance_km, Some(1600.0));
    }

    #[test]
    fn test_events_close_at_end_of_data() {
        let mut records = vec![
            record(0, Some(("s", -100.0)), &[("s", -100.0, 800.0), ("n", -90.0, 700.0)]),
        ];
        let events = detect(&mut records, EventParams::default());
        // A4 opens immediately (−90 > −99) and closes at the final record.
        let a4: Vec<&HandoverEvent> =
            events.iter().filter(|e| e.event_type == EventType::A4).collect();
        assert_eq!(a4.len(), 1);
        assert_eq!(a4[0].exit_time, Some(records[0].timestamp));
    }
}
