use std::sync::Arc;

use anyhow::Result;
use gammafit::prelude::*;
use ndarray::{Array1, Array2};

const INDEX: f64 = 2.4;
const AMPLITUDE: f64 = 3.5e-11;

/// A shared power law with the true parameters
fn crab() -> Arc<SkyModel> {
    Arc::new(SkyModel::new("crab", PowerLaw::new(INDEX, AMPLITUDE, 1.0)))
}

/// Spectrum whose counts equal the prediction of the attached models
fn asimov_spectrum(name: &str, model: Arc<SkyModel>, exposure: f64) -> Result<SpectrumDataset> {
    let edges = log_edges(1.0, 100.0, 12);
    let n = edges.len() - 1;
    let mut dataset = SpectrumDataset::new(
        name,
        edges,
        Array1::zeros(n),
        Array1::from_elem(n, exposure),
        Array1::from_elem(n, 2.0),
    )?
    .with_models(vec![model]);
    dataset.counts = dataset.npred();
    Ok(dataset)
}

/// ON/OFF spectrum with counts at their expected values
fn asimov_onoff(name: &str, model: Arc<SkyModel>) -> Result<SpectrumDatasetOnOff> {
    let edges = log_edges(1.0, 100.0, 10);
    let n = edges.len() - 1;
    let alpha = 0.2;
    let background = Array1::from_elem(n, 4.0);
    let mut dataset = SpectrumDatasetOnOff::new(
        name,
        edges,
        Array1::zeros(n),
        &background / alpha,
        Array1::from_elem(n, alpha),
        Array1::from_elem(n, 5e13),
    )?
    .with_models(vec![model]);
    dataset.counts = dataset.npred_signal() + &background;
    Ok(dataset)
}

fn move_away(model: &SkyModel) {
    let parameters = model.parameters();
    parameters.get("index").unwrap().set_value(2.0);
    parameters.get("amplitude").unwrap().set_value(1e-11);
}

fn quiet_settings() -> Settings {
    let mut settings = Settings::new();
    settings.output.write = false;
    settings.log.write = false;
    settings
}

#[test]
fn test_joint_fit_recovers_truth() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![
        Box::new(asimov_spectrum("hess", model.clone(), 1e14)?),
        Box::new(asimov_onoff("magic", model.clone())?),
    ])?;
    move_away(&model);

    let result = Fit::new(quiet_settings()).run(&datasets)?;
    assert!(result.converged);
    assert_eq!(result.names(), vec!["index", "amplitude"]);

    let index = result.value("index").unwrap();
    let amplitude = result.value("amplitude").unwrap();
    assert!((index - INDEX).abs() < 1e-3, "index = {}", index);
    assert!((amplitude / AMPLITUDE - 1.0).abs() < 1e-3, "amplitude = {}", amplitude);

    // The fitted values live in the shared model
    let parameters = model.parameters();
    assert_eq!(parameters.get("index").unwrap().value(), index);

    let covariance = result.covariance().expect("covariance");
    assert_eq!(covariance.dim(), (2, 2));
    let index_error = result.error("index").unwrap();
    assert!(index_error > 0.0 && index_error < 0.1);
    assert!(result.error("amplitude").unwrap() > 0.0);
    // With the reference energy at the low end of the range, a softer index is compensated by a
    // larger amplitude
    assert!(result.parameters.correlation(0, 1).unwrap() > 0.0);
    Ok(())
}

#[test]
fn test_joint_fit_with_map_recovers_position_and_width() -> Result<()> {
    let blob = Arc::new(
        SkyModel::new("blob", PowerLaw::new(2.2, 1e-11, 1.0))
            .with_spatial(GaussianSpatial::new(0.1, -0.05, 0.2)?),
    );

    let geom = MapGeom::centred(0.0, 0.0, 2.0, 0.1)?;
    let shape = (4, geom.n_pixels());
    let mut map = MapDataset::new(
        "cta",
        log_edges(1.0, 10.0, 4),
        geom,
        Array2::zeros(shape),
        Array2::from_elem(shape, 1e15),
        Array2::from_elem(shape, 0.1),
    )?
    .with_psf_sigma(0.05)?
    .with_models(vec![blob.clone()]);
    map.counts = map.npred()?;

    let datasets = Datasets::from_vec(vec![
        Box::new(map),
        Box::new(asimov_spectrum("hess", blob.clone(), 1e14)?),
    ])?;

    let parameters = blob.parameters();
    parameters.get("lon_0").unwrap().set_value(0.05);
    parameters.get("lat_0").unwrap().set_value(0.0);
    parameters.get("sigma").unwrap().set_value(0.3);
    parameters.get("index").unwrap().set_value(2.0);

    let result = Fit::new(quiet_settings()).run(&datasets)?;
    assert!(result.converged);
    assert_eq!(
        result.names(),
        vec!["index", "amplitude", "lon_0", "lat_0", "sigma"]
    );
    let close = |name: &str, truth: f64| {
        let value = result.value(name).unwrap();
        assert!((value - truth).abs() < 1e-3, "{} = {}", name, value);
    };
    close("index", 2.2);
    close("lon_0", 0.1);
    close("lat_0", -0.05);
    close("sigma", 0.2);
    assert!(result.error("sigma").unwrap() > 0.0);
    Ok(())
}

#[test]
fn test_joint_fit_is_tighter_than_single() -> Result<()> {
    let model = crab();
    let single = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    let single_error = Fit::new(quiet_settings()).run(&single)?.error("index").unwrap();

    let model = crab();
    let joint = Datasets::from_vec(vec![
        Box::new(asimov_spectrum("hess", model.clone(), 1e14)?),
        Box::new(asimov_spectrum("hess2", model.clone(), 1e14)?),
    ])?;
    let joint_error = Fit::new(quiet_settings()).run(&joint)?.error("index").unwrap();

    // Twice the exposure, errors shrink by sqrt(2)
    assert!((single_error / joint_error - 2_f64.sqrt()).abs() < 0.05);
    Ok(())
}

#[test]
fn test_frozen_parameters_are_not_fitted() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    model.parameters().get("amplitude").unwrap().set_value(1e-11);
    model.parameters().get("index").unwrap().set_frozen(true);

    let result = Fit::new(quiet_settings()).optimize(&datasets)?;
    assert_eq!(result.names(), vec!["amplitude"]);
    assert_eq!(model.parameters().get("index").unwrap().value(), INDEX);
    assert!((result.value("amplitude").unwrap() / AMPLITUDE - 1.0).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_no_free_parameters() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    model.parameters().freeze_all();

    let result = Fit::new(quiet_settings()).optimize(&datasets);
    assert!(matches!(result, Err(FitError::NoFreeParameters)));
    Ok(())
}

#[test]
fn test_failed_fit_restores_parameters() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    move_away(&model);

    let mut settings = quiet_settings();
    settings.fit.max_iters = 1;
    let result = Fit::new(settings).optimize(&datasets);
    assert!(matches!(result, Err(FitError::NotConverged { .. })));

    let parameters = model.parameters();
    assert_eq!(parameters.get("index").unwrap().value(), 2.0);
    assert_eq!(parameters.get("amplitude").unwrap().value(), 1e-11);
    Ok(())
}

#[test]
fn test_non_finite_statistic() -> Result<()> {
    let model = crab();
    let points = FluxPointsDataset::new(
        "sed",
        Array1::from(vec![1.0, 2.0]),
        Array1::from(vec![f64::NAN, 1e-12]),
        Array1::from(vec![1e-12, 1e-13]),
        Array1::from(vec![false, false]),
    )?
    .with_models(vec![model.clone()]);
    let datasets = Datasets::from_vec(vec![Box::new(points)])?;

    let result = Fit::new(quiet_settings()).optimize(&datasets);
    match result {
        Err(FitError::NonFinite { parameters }) => assert_eq!(parameters.len(), 2),
        other => panic!("Expected a non-finite statistic, got {:?}", other.map(|r| r.total_stat)),
    }
    assert_eq!(model.parameters().get("index").unwrap().value(), INDEX);
    Ok(())
}

#[test]
fn test_bounds_are_respected() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    let index = model.parameters().get("index").unwrap().clone();
    index.set_value(2.0);
    index.set_bounds(1.5, 2.2)?;

    let result = Fit::new(quiet_settings()).optimize(&datasets)?;
    let fitted = result.value("index").unwrap();
    assert!(fitted <= 2.2 && fitted > 2.1, "index = {}", fitted);
    Ok(())
}

#[test]
fn test_start_outside_bounds() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    model.parameters().get("index").unwrap().set_bounds(2.5, 3.0)?;

    match Fit::new(quiet_settings()).optimize(&datasets) {
        Err(FitError::OutOfBounds { name, value, .. }) => {
            assert_eq!(name, "index");
            assert_eq!(value, INDEX);
        }
        other => panic!("Expected a start outside the bounds, got {:?}", other.map(|r| r.total_stat)),
    }
    assert_eq!(model.parameters().get("index").unwrap().value(), INDEX);
    Ok(())
}

#[test]
fn test_fit_result_output() -> Result<()> {
    let model = crab();
    let datasets = Datasets::from_vec(vec![Box::new(asimov_spectrum("hess", model.clone(), 1e14)?)])?;
    let result = Fit::new(quiet_settings()).run(&datasets)?;

    let summary = format!("{}", result);
    assert!(summary.contains("converged    : true"));
    assert!(summary.contains("amplitude"));

    let folder = std::env::temp_dir().join(format!("gammafit_fit_{}", std::process::id()));
    let folder = folder.to_string_lossy().to_string();
    result.write_csv(&folder)?;
    let table = std::fs::read_to_string(std::path::Path::new(&folder).join("fit_result.csv"))?;
    assert!(table.starts_with("name,value,error,unit,min,max"));
    assert_eq!(table.lines().count(), 3);
    std::fs::remove_dir_all(&folder)?;
    Ok(())
}
