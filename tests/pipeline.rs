use eyestate::{Error, EyeState, FeatureVector, ScoringContext, ValidationError, FEATURE_COUNT};
use ndarray::Array2;
use proptest::prelude::*;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn context() -> ScoringContext {
    ScoringContext::load(
        &fixture("scaler.json"),
        &fixture("eye_state_model.json"),
        None,
    )
    .unwrap()
}

#[test]
fn all_zero_readings_regression() {
    let p = context().score(&FeatureVector::zeros());
    assert_eq!(p.state, EyeState::Closed);
    assert!((p.probabilities.closed - 0.75).abs() < 1e-12);
    assert_eq!(format!("{:.2}", p.confidence()), "75.00");
    assert!(!p.is_low_confidence());
}

#[test]
fn strong_occipital_reading_is_open() {
    let v = FeatureVector::from_named([("O1", 5.0), ("O2", -1.0)]).unwrap();
    let p = context().score(&v);
    assert_eq!(p.state, EyeState::Open);
    assert_eq!(format!("{:.2}", p.confidence()), "60.00");
    assert!(!p.is_low_confidence());
}

#[test]
fn close_call_is_flagged() {
    let v = FeatureVector::from_named([("AF3", 2.0)]).unwrap();
    let p = context().score(&v);
    assert_eq!(p.state, EyeState::Closed);
    assert_eq!(format!("{:.2}", p.confidence()), "53.33");
    assert!(p.is_low_confidence());
}

#[test]
fn transform_uses_stored_parameters() {
    let out = context().transform(&FeatureVector::from_slice(&[2.5; FEATURE_COUNT]).unwrap());
    assert!(out.iter().all(|v| (*v - 1.0).abs() < 1e-12));
}

#[test]
fn importance_ranked_descending() {
    let ranked = context().feature_importance();
    assert_eq!(ranked.len(), FEATURE_COUNT);
    assert_eq!(ranked[0].0, "O1");
    assert_eq!(ranked[1].0, "O2");
    assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));
}

#[test]
fn missing_model_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = ScoringContext::load(
        &fixture("scaler.json"),
        &dir.path().join("eye_state_model.json"),
        None,
    )
    .err()
    .unwrap();
    assert!(err.is_fatal());
}

#[test]
fn corrupt_scaler_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scaler.json");
    std::fs::write(&path, b"\x80\x04\x95 not json").unwrap();
    let err = ScoringContext::load(&path, &fixture("eye_state_model.json"), None)
        .err()
        .unwrap();
    assert!(err.is_fatal());
}

#[test]
fn matrix_with_wrong_width_is_rejected() {
    let err = context()
        .score_matrix(Array2::zeros((2, FEATURE_COUNT - 1)).view())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::Length { expected: 14, actual: 13 })
    ));
}

#[test]
fn matrix_with_non_finite_cell_is_rejected() {
    let mut matrix = Array2::zeros((3, FEATURE_COUNT));
    matrix[[1, 0]] = f64::NAN;
    let err = context().score_matrix(matrix.view()).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::NonFinite(ref name)) if name == "AF3"
    ));

    matrix[[1, 0]] = 0.0;
    matrix[[2, 13]] = f64::INFINITY;
    let err = context().score_matrix(matrix.view()).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::NonFinite(ref name)) if name == "AF4"
    ));
}

#[test]
fn empty_matrix_scores_nothing() {
    let batch = context()
        .score_matrix(Array2::zeros((0, FEATURE_COUNT)).view())
        .unwrap();
    assert!(batch.is_empty());
}

proptest! {
    #[test]
    fn prediction_is_a_distribution(values in prop::collection::vec(-1.0e3f64..1.0e3, FEATURE_COUNT)) {
        let ctx = context();
        let v = FeatureVector::from_slice(&values).unwrap();
        let p = ctx.predict(&ctx.transform(&v));
        let pr = p.probabilities;
        prop_assert!((pr.closed + pr.open - 1.0).abs() < 1e-9);
        prop_assert!(pr.closed >= 0.0 && pr.open >= 0.0);
        prop_assert!(matches!(p.state, EyeState::Closed | EyeState::Open));
        prop_assert_eq!(p.confidence(), pr.closed.max(pr.open) * 100.0);
        prop_assert_eq!(p.is_low_confidence(), (pr.closed - pr.open).abs() < 0.10);
    }

    #[test]
    fn single_and_matrix_scoring_agree(rows in prop::collection::vec(prop::collection::vec(-10.0f64..10.0, FEATURE_COUNT), 1..8)) {
        let ctx = context();
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let matrix = Array2::from_shape_vec((rows.len(), FEATURE_COUNT), flat).unwrap();
        let batch = ctx.score_matrix(matrix.view()).unwrap();
        for (row, p) in rows.iter().zip(&batch) {
            let single = ctx.score(&FeatureVector::from_slice(row).unwrap());
            prop_assert_eq!(single.state, p.state);
            prop_assert!((single.confidence() - p.confidence()).abs() < 1e-9);
        }
    }
}
