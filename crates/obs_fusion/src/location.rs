//! Spatio-temporal binning of procedure positions for overview rendering.
//!
//! Two binnings exist. Cube binning cuts time, latitude and longitude into a
//! fixed grid and keeps one point per non-empty cell. Time-slice binning only
//! cuts time, using the same min/step bookkeeping as result decimation.

use std::collections::BTreeMap;

use crate::cursor::to_millis;
use crate::decimation::Domain;
use crate::geometry::{centroid, BoundingBox, Geometry};
use crate::model::HistoricalLocation;

/// Positions of each procedure, ordered by time.
pub type LocationsByProcedure = BTreeMap<String, Vec<HistoricalLocation>>;

/// Binning applied to historical locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationBinning {
    /// `width` time slices times `spatial_cells` cells per spatial axis.
    Cube { spatial_cells: usize },
    TimeSlice,
}

impl Default for LocationBinning {
    fn default() -> Self {
        Self::Cube { spatial_cells: 10 }
    }
}

/// Keeps only positions inside `bbox`.
pub fn filter_by_bbox(locations: &mut LocationsByProcedure, bbox: &BoundingBox) {
    for entries in locations.values_mut() {
        entries.retain(|entry| bbox.contains(&entry.position));
    }
    locations.retain(|_, entries| !entries.is_empty());
}

/// Reduces `locations` to at most one position per bin and procedure.
///
/// `bbox` bounds the cube grid; the default CRS domain is used without it.
pub fn decimate_locations(
    locations: &LocationsByProcedure,
    width: usize,
    binning: LocationBinning,
    bbox: Option<&BoundingBox>,
) -> LocationsByProcedure {
    match binning {
        LocationBinning::Cube { spatial_cells } => {
            let domain = bbox.copied().unwrap_or_else(BoundingBox::crs_domain);
            cube_binning(locations, width, spatial_cells, &domain)
        }
        LocationBinning::TimeSlice => time_slice_binning(locations, width),
    }
}

fn cube_binning(
    locations: &LocationsByProcedure,
    width: usize,
    spatial_cells: usize,
    domain: &BoundingBox,
) -> LocationsByProcedure {
    let times = locations.values().flatten().map(|e| to_millis(e.time) as f64);
    let (min, max, count) = times.fold((f64::INFINITY, f64::NEG_INFINITY, 0u64), |acc, t| {
        (acc.0.min(t), acc.1.max(t), acc.2 + 1)
    });
    if count == 0 {
        return LocationsByProcedure::new();
    }
    let time_axis = Domain::new(min, max, count, width.max(1));
    let cells = spatial_cells.max(1);
    let x_axis = Domain::new(domain.min_x, domain.max_x, 0, cells);
    let y_axis = Domain::new(domain.min_y, domain.max_y, 0, cells);

    locations
        .iter()
        .map(|(procedure, entries)| {
            let mut bins: BTreeMap<(usize, usize, usize), Vec<&HistoricalLocation>> =
                BTreeMap::new();
            for entry in entries {
                let cell = (
                    time_axis.bucket(to_millis(entry.time) as f64, width.max(1)),
                    y_axis.bucket(entry.position.y, cells),
                    x_axis.bucket(entry.position.x, cells),
                );
                bins.entry(cell).or_default().push(entry);
            }
            let mut reduced: Vec<HistoricalLocation> = bins.into_values().filter_map(merge).collect();
            reduced.sort_by_key(|entry| entry.time);
            (procedure.clone(), reduced)
        })
        .collect()
}

fn time_slice_binning(locations: &LocationsByProcedure, width: usize) -> LocationsByProcedure {
    let width = width.max(1);
    locations
        .iter()
        .map(|(procedure, entries)| {
            let (min, max) = entries
                .iter()
                .map(|e| to_millis(e.time) as f64)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |acc, t| {
                    (acc.0.min(t), acc.1.max(t))
                });
            let domain = Domain::new(min, max, entries.len() as u64, width);
            if domain.passthrough(width) {
                return (procedure.clone(), entries.clone());
            }
            let mut slices: BTreeMap<usize, Vec<&HistoricalLocation>> = BTreeMap::new();
            for entry in entries {
                slices
                    .entry(domain.bucket(to_millis(entry.time) as f64, width))
                    .or_default()
                    .push(entry);
            }
            let reduced = slices.into_values().filter_map(merge).collect();
            (procedure.clone(), reduced)
        })
        .collect()
}

/// One entry as is; several collapse to their centroid at the earliest time.
fn merge(entries: Vec<&HistoricalLocation>) -> Option<HistoricalLocation> {
    match entries.as_slice() {
        [] => None,
        [single] => Some(**single),
        many => {
            let points: Vec<Geometry> = many.iter().map(|e| Geometry::Point(e.position)).collect();
            let position = centroid(points.iter())?;
            let time = many.iter().map(|e| e.time).min()?;
            Some(HistoricalLocation { time, position })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coord;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 6, 1)
            .and_then(|d| d.and_hms_opt(0, minute, 0))
            .expect("valid time")
    }

    fn track(points: &[(u32, f64, f64)]) -> LocationsByProcedure {
        let entries = points
            .iter()
            .map(|(m, x, y)| HistoricalLocation {
                time: at(*m),
                position: Coord::new(*x, *y),
            })
            .collect();
        BTreeMap::from([("ship-1".to_string(), entries)])
    }

    #[test]
    fn cube_keeps_one_point_per_cell() {
        let locations = track(&[(0, 1.0, 1.0), (1, 3.0, 3.0), (59, 150.0, 80.0)]);
        let reduced = decimate_locations(&locations, 2, LocationBinning::Cube { spatial_cells: 4 }, None);
        let entries = &reduced["ship-1"];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].time, at(0));
        assert_eq!(entries[0].position, Coord::new(2.0, 2.0));
        assert_eq!(entries[1].position, Coord::new(150.0, 80.0));
    }

    #[test]
    fn time_slices_average_positions() {
        let points: Vec<(u32, f64, f64)> = (0..6).map(|m| (m * 10, f64::from(m), 0.0)).collect();
        let reduced = decimate_locations(&track(&points), 3, LocationBinning::TimeSlice, None);
        let entries = &reduced["ship-1"];
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].position, Coord::new(0.5, 0.0));
        assert_eq!(entries[2].time, at(40));

        let short = track(&[(0, 1.0, 1.0), (5, 2.0, 2.0)]);
        assert_eq!(decimate_locations(&short, 3, LocationBinning::TimeSlice, None), short);
    }

    #[test]
    fn bbox_filter_drops_outside_points() {
        let mut locations = track(&[(0, 1.0, 1.0), (1, 50.0, 50.0)]);
        filter_by_bbox(&mut locations, &BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(locations["ship-1"].len(), 1);
        filter_by_bbox(&mut locations, &BoundingBox::new(20.0, 20.0, 30.0, 30.0));
        assert!(locations.is_empty());
    }
}
