use std::sync::Arc;

use anyhow::Result;
use gammafit::prelude::*;
use ndarray::Array1;

fn crab() -> Arc<SkyModel> {
    Arc::new(SkyModel::new("crab", PowerLaw::new(2.4, 3.5e-11, 1.0)))
}

fn asimov_datasets(model: Arc<SkyModel>) -> Result<Datasets> {
    let edges = log_edges(1.0, 100.0, 12);
    let n = edges.len() - 1;
    let mut dataset = SpectrumDataset::new(
        "hess",
        edges,
        Array1::zeros(n),
        Array1::from_elem(n, 1e15),
        Array1::from_elem(n, 2.0),
    )?
    .with_models(vec![model]);
    dataset.counts = dataset.npred();
    Datasets::from_vec(vec![Box::new(dataset)])
}

fn settings(parallel: bool) -> Settings {
    let mut settings = Settings::new();
    settings.output.write = false;
    settings.log.write = false;
    settings.flux_points.parallel = parallel;
    settings
}

#[test]
fn test_flux_points_match_true_model() -> Result<()> {
    let model = crab();
    let datasets = asimov_datasets(model.clone())?;
    let estimator = FluxPointsEstimator::new(log_edges(1.0, 100.0, 4), "crab", &settings(false))?;
    let points = estimator.run(&datasets)?;

    assert_eq!(points.len(), 4);
    for point in points.iter() {
        assert!((point.norm - 1.0).abs() < 1e-3, "norm = {}", point.norm);
        assert!(point.norm_errn > 0.0 && point.norm_errp > 0.0);
        assert!(point.norm_ul > point.norm + point.norm_errp);
        assert!(point.ts > 25.0);
        assert!(!point.is_ul);
        assert!(point.counts > 0.0);
        let expected = model.spectral().evaluate(point.e_ref);
        assert!((point.dnde() / expected - 1.0).abs() < 1e-3);
    }

    // The source model is left untouched
    let parameters = model.parameters();
    assert_eq!(parameters.get("index").unwrap().value(), 2.4);
    assert!(!parameters.get("index").unwrap().is_frozen());
    Ok(())
}

#[test]
fn test_parallel_matches_sequential() -> Result<()> {
    let model = crab();
    let datasets = asimov_datasets(model)?;
    let edges = log_edges(1.0, 100.0, 4);
    let sequential =
        FluxPointsEstimator::new(edges.clone(), "crab", &settings(false))?.run(&datasets)?;
    let parallel = FluxPointsEstimator::new(edges, "crab", &settings(true))?.run(&datasets)?;
    assert_eq!(sequential.points, parallel.points);
    Ok(())
}

#[test]
fn test_low_counts_give_upper_limits() -> Result<()> {
    let datasets = asimov_datasets(crab())?;
    let mut settings = settings(false);
    settings.flux_points.min_counts = 1e9;
    let points =
        FluxPointsEstimator::new(log_edges(1.0, 100.0, 2), "crab", &settings)?.run(&datasets)?;
    assert!(points.iter().all(|p| p.is_ul));
    Ok(())
}

#[test]
fn test_bin_without_data_is_undefined() -> Result<()> {
    let model = crab();
    let edges = log_edges(1.0, 100.0, 4);
    let n = edges.len() - 1;
    let mut dataset = SpectrumDataset::new(
        "coarse",
        edges,
        Array1::zeros(n),
        Array1::from_elem(n, 1e15),
        Array1::from_elem(n, 2.0),
    )?
    .with_models(vec![model]);
    dataset.counts = dataset.npred();
    let datasets = Datasets::from_vec(vec![Box::new(dataset)])?;

    // The middle bin, [4.6, 21.5] TeV, contains no complete data bin
    let points = FluxPointsEstimator::new(log_edges(1.0, 100.0, 3), "crab", &settings(false))?
        .run(&datasets)?;
    let middle = &points.points[1];
    assert!(!middle.is_defined());
    assert!(middle.norm.is_nan() && middle.ts.is_nan() && middle.norm_ul.is_nan());
    assert!(middle.counts.is_nan());
    assert!(!middle.is_ul);

    for point in [&points.points[0], &points.points[2]] {
        assert!(point.is_defined());
        assert!((point.norm - 1.0).abs() < 1e-3, "norm = {}", point.norm);
    }

    let sed = points.to_dataset("sed")?;
    assert_eq!(sed.e_ref.len(), 2);
    Ok(())
}

#[test]
fn test_faint_source_gives_upper_limits() -> Result<()> {
    // Counts at the background level only
    let model = crab();
    let edges = log_edges(1.0, 100.0, 12);
    let n = edges.len() - 1;
    let dataset = SpectrumDataset::new(
        "hess",
        edges,
        Array1::from_elem(n, 20.0),
        Array1::from_elem(n, 1e14),
        Array1::from_elem(n, 20.0),
    )?
    .with_models(vec![model]);
    let datasets = Datasets::from_vec(vec![Box::new(dataset)])?;

    let points = FluxPointsEstimator::new(log_edges(1.0, 100.0, 2), "crab", &settings(false))?
        .run(&datasets)?;
    for point in points.iter() {
        assert!(point.counts >= 1.0);
        assert!(point.ts < 4.0, "ts = {}", point.ts);
        assert!(point.norm < 1e-3, "norm = {}", point.norm);
        assert!(point.is_ul);
        assert!(point.norm_ul > 0.0 && point.norm_ul.is_finite());
    }
    Ok(())
}

#[test]
fn test_unknown_source() -> Result<()> {
    let datasets = asimov_datasets(crab())?;
    let estimator = FluxPointsEstimator::new(log_edges(1.0, 100.0, 2), "vela", &settings(false))?;
    assert!(estimator.run(&datasets).is_err());
    Ok(())
}

#[test]
fn test_flux_points_join_a_fit() -> Result<()> {
    let datasets = asimov_datasets(crab())?;
    let points = FluxPointsEstimator::new(log_edges(1.0, 100.0, 6), "crab", &settings(false))?
        .run(&datasets)?;

    let sed_model = Arc::new(SkyModel::new("crab", PowerLaw::new(2.0, 1e-11, 1.0)));
    let sed = points.to_dataset("sed")?.with_models(vec![sed_model.clone()]);
    let sed = Datasets::from_vec(vec![Box::new(sed)])?;

    let result = Fit::new(settings(false)).optimize(&sed)?;
    let index = result.value("index").unwrap();
    assert!((index - 2.4).abs() < 0.05, "index = {}", index);
    Ok(())
}

#[test]
fn test_flux_points_csv() -> Result<()> {
    let datasets = asimov_datasets(crab())?;
    let points = FluxPointsEstimator::new(log_edges(1.0, 100.0, 2), "crab", &settings(false))?
        .run(&datasets)?;

    let folder = std::env::temp_dir().join(format!("gammafit_sed_{}", std::process::id()));
    let folder = folder.to_string_lossy().to_string();
    points.write_csv(&folder)?;
    let table = std::fs::read_to_string(std::path::Path::new(&folder).join("flux_points.csv"))?;
    let header = table.lines().next().unwrap_or_default();
    assert_eq!(
        header,
        "e_min,e_max,e_ref,ref_dnde,norm,norm_errn,norm_errp,norm_ul,ts,counts,is_ul"
    );
    assert_eq!(table.lines().count(), 3);
    std::fs::remove_dir_all(&folder)?;
    Ok(())
}
