//! Lossless mapping between segments and model file names
//!
//! Each component is percent-encoded so the separator can never appear inside
//! it, which keeps names like `payment+service` + `aws-cloud` distinct from
//! `payment` + `service+aws-cloud`. Only the exact output of
//! [`model_file_name`] maps back to a segment.

use crate::models::Segment;

/// Suffix of per-segment model artifacts
pub const MODEL_SUFFIX: &str = ".model.json";

/// File holding every segment's traffic baseline
pub const BASELINES_FILE: &str = "traffic_baselines.json";

/// Always percent-encoded inside a component
const SEPARATOR: char = '+';

/// Encode a segment as `<service>+<environment>`
pub fn encode_segment(segment: &Segment) -> String {
    format!(
        "{}{}{}",
        urlencoding::encode(&segment.service),
        SEPARATOR,
        urlencoding::encode(&segment.environment)
    )
}

/// Inverse of [`encode_segment`]; `None` for anything it could not have produced
pub fn decode_segment(encoded: &str) -> Option<Segment> {
    let (service, environment) = encoded.split_once(SEPARATOR)?;
    let segment = Segment::new(
        urlencoding::decode(service).ok()?.into_owned(),
        urlencoding::decode(environment).ok()?.into_owned(),
    );
    // Rejects lowercase escapes, stray separators and unescaped bytes
    (encode_segment(&segment) == encoded).then_some(segment)
}

pub fn model_file_name(segment: &Segment) -> String {
    format!("{}{}", encode_segment(segment), MODEL_SUFFIX)
}

pub fn segment_from_file_name(file_name: &str) -> Option<Segment> {
    decode_segment(file_name.strip_suffix(MODEL_SUFFIX)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_segment_round_trip() {
        let segment = Segment::new("payment-service", "aws-cloud");
        let name = model_file_name(&segment);
        assert_eq!(name, "payment-service+aws-cloud.model.json");
        assert_eq!(segment_from_file_name(&name), Some(segment));
    }

    #[test]
    fn test_separator_inside_components() {
        let a = Segment::new("payment+service", "aws+cloud");
        let b = Segment::new("payment", "service+aws+cloud");
        assert_ne!(encode_segment(&a), encode_segment(&b));
        assert_eq!(decode_segment(&encode_segment(&a)), Some(a));
        assert_eq!(decode_segment(&encode_segment(&b)), Some(b));
    }

    #[test]
    fn test_unusual_characters_round_trip() {
        for segment in [
            Segment::new("svc/with/slashes", "env%percent"),
            Segment::new("ünïcødé", "on prem"),
            Segment::new("", "empty-service"),
            Segment::new("snake_case_service", "env~tilde"),
        ] {
            let name = model_file_name(&segment);
            assert!(!name.contains('/'));
            assert_eq!(segment_from_file_name(&name), Some(segment));
        }
    }

    #[test]
    fn test_malformed_names_rejected() {
        assert_eq!(segment_from_file_name("no-separator.model.json"), None);
        assert_eq!(segment_from_file_name("a+b+c.model.json"), None);
        assert_eq!(segment_from_file_name("bad%zz+env.model.json"), None);
        assert_eq!(segment_from_file_name("truncated%4+env.model.json"), None);
        assert_eq!(segment_from_file_name("svc+env.model.json.tmp"), None);
        assert_eq!(segment_from_file_name("svc env+prod.model.json"), None);
        assert_eq!(segment_from_file_name(BASELINES_FILE), None);
    }

    #[test]
    fn test_non_canonical_escapes_rejected() {
        // Lowercase hex decodes to the same segment as the canonical name
        assert_eq!(
            segment_from_file_name("svc%2F+env.model.json"),
            Some(Segment::new("svc/", "env"))
        );
        assert_eq!(segment_from_file_name("svc%2f+env.model.json"), None);
        assert_eq!(segment_from_file_name("svc%+2+env.model.json"), None);
        assert_eq!(segment_from_file_name("svc%+2_env.model.json"), None);
        assert_eq!(segment_from_file_name("svc%2f_env.model.json"), None);
        assert_eq!(segment_from_file_name("svc%2Denv+prod.model.json"), None);
    }
}
