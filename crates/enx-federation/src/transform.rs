//! Per-key transformation from stored exposures to the transport shape.

use enx_core::{Exposure, KEY_LENGTH, ReportType};

use crate::proto;

/// Computes the regions a key is reported in: the exposure's regions
/// intersected with the include set (when one is given) minus the exclude
/// set.
fn report_regions(exposure: &Exposure, include: &[String], exclude: &[String]) -> Vec<String> {
    exposure
        .regions
        .iter()
        .filter(|region| include.is_empty() || include.contains(region))
        .filter(|region| !exclude.contains(region))
        .cloned()
        .collect()
}

fn proto_report_type(report_type: ReportType) -> proto::ReportType {
    match report_type {
        ReportType::ConfirmedTest => proto::ReportType::ConfirmedTest,
        ReportType::ConfirmedClinicalDiagnosis => proto::ReportType::ConfirmedClinicalDiagnosis,
        ReportType::Revoked => proto::ReportType::Revoked,
        ReportType::Unknown => proto::ReportType::Unknown,
    }
}

/// Transforms a primary-class exposure, or drops it: malformed key
/// material and keys with no reportable region are silently skipped.
pub(crate) fn primary(
    exposure: &Exposure,
    include: &[String],
    exclude: &[String],
) -> Option<proto::ExposureKey> {
    if exposure.exposure_key.len() != KEY_LENGTH {
        return None;
    }
    let regions = report_regions(exposure, include, exclude);
    if regions.is_empty() {
        return None;
    }
    Some(proto::ExposureKey {
        exposure_key: exposure.exposure_key.clone(),
        transmission_risk: exposure.transmission_risk,
        interval_number: exposure.interval_number,
        interval_count: exposure.interval_count,
        report_type: proto_report_type(ReportType::from_database_string(&exposure.report_type))
            as i32,
        days_since_symptom_onset: exposure.days_since_symptom_onset,
        traveler: exposure.traveler,
        regions,
    })
}

/// Transforms a revised-class exposure using the revised fields.
pub(crate) fn revised(
    exposure: &Exposure,
    include: &[String],
    exclude: &[String],
) -> Option<proto::ExposureKey> {
    if exposure.exposure_key.len() != KEY_LENGTH {
        return None;
    }
    let revised_report_type = exposure.revised_report_type.as_deref()?;
    let regions = report_regions(exposure, include, exclude);
    if regions.is_empty() {
        return None;
    }
    Some(proto::ExposureKey {
        exposure_key: exposure.exposure_key.clone(),
        transmission_risk: exposure.revised_transmission_risk.unwrap_or(0),
        interval_number: exposure.interval_number,
        interval_count: exposure.interval_count,
        report_type: proto_report_type(ReportType::from_database_string(revised_report_type))
            as i32,
        days_since_symptom_onset: exposure.revised_days_since_symptom_onset,
        traveler: exposure.traveler,
        regions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn exposure(regions: &[&str]) -> Exposure {
        Exposure {
            id: 1,
            exposure_key: vec![0u8; KEY_LENGTH],
            transmission_risk: 3,
            regions: regions.iter().map(|r| r.to_string()).collect(),
            interval_number: 2_650_000,
            interval_count: 144,
            created_at: OffsetDateTime::from_unix_timestamp(100).unwrap(),
            local_provenance: true,
            traveler: false,
            report_type: "confirmed".to_string(),
            days_since_symptom_onset: Some(2),
            revised_report_type: None,
            revised_at: None,
            revised_transmission_risk: None,
            revised_days_since_symptom_onset: None,
        }
    }

    #[test]
    fn test_primary_region_scoping() {
        let include = vec!["US".to_string()];
        let exclude = vec!["CH".to_string()];

        let key = primary(&exposure(&["US", "CH", "MX"]), &include, &exclude).unwrap();
        assert_eq!(key.regions, vec!["US"]);
        assert_eq!(key.report_type, proto::ReportType::ConfirmedTest as i32);
        assert_eq!(key.days_since_symptom_onset, Some(2));

        // A key left with no region is dropped entirely.
        assert!(primary(&exposure(&["CH"]), &include, &exclude).is_none());
    }

    #[test]
    fn test_primary_drops_malformed_key_material() {
        let mut malformed = exposure(&["US"]);
        malformed.exposure_key = vec![0u8; 15];
        assert!(primary(&malformed, &[], &[]).is_none());
    }

    #[test]
    fn test_primary_unknown_report_type() {
        let mut unknown = exposure(&["US"]);
        unknown.report_type = "self_reported".to_string();
        let key = primary(&unknown, &[], &[]).unwrap();
        assert_eq!(key.report_type, proto::ReportType::Unknown as i32);
    }

    #[test]
    fn test_revised_uses_revised_fields() {
        let mut revised_exposure = exposure(&["US"]);
        revised_exposure.revised_report_type = Some("negative".to_string());
        revised_exposure.revised_at = Some(OffsetDateTime::from_unix_timestamp(200).unwrap());
        revised_exposure.revised_transmission_risk = Some(5);
        revised_exposure.revised_days_since_symptom_onset = Some(4);

        let key = revised(&revised_exposure, &[], &[]).unwrap();
        assert_eq!(key.report_type, proto::ReportType::Revoked as i32);
        assert_eq!(key.transmission_risk, 5);
        assert_eq!(key.days_since_symptom_onset, Some(4));

        // Without a revised report type there is nothing to emit.
        assert!(revised(&exposure(&["US"]), &[], &[]).is_none());
    }
}
