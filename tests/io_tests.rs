use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use gammafit::prelude::*;
use ndarray::{Array1, Array2};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gammafit_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn mixed_datasets() -> Result<Datasets> {
    let crab = Arc::new(SkyModel::new("crab", PowerLaw::new(2.4, 3.5e-11, 1.0)));
    let blob = Arc::new(
        SkyModel::new("blob", PowerLaw::new(2.0, 1e-12, 1.0))
            .with_spatial(GaussianSpatial::new(0.1, -0.1, 0.2)?),
    );

    let edges = log_edges(1.0, 100.0, 8);
    let n = edges.len() - 1;
    let mut spectrum = SpectrumDataset::new(
        "hess",
        edges.clone(),
        Array1::zeros(n),
        Array1::from_elem(n, 1e14),
        Array1::from_elem(n, 1.5),
    )?
    .with_models(vec![crab.clone()]);
    spectrum.fake(1)?;

    let background = Array1::from_elem(n, 3.0);
    let mut onoff = SpectrumDatasetOnOff::new(
        "magic",
        edges,
        Array1::zeros(n),
        &background * 5.0,
        Array1::from_elem(n, 0.2),
        Array1::from_elem(n, 5e13),
    )?
    .with_models(vec![crab.clone()]);
    onoff.fake(&background, 2)?;

    let geom = MapGeom::centred(0.0, 0.0, 0.5, 0.1)?;
    let shape = (3, geom.n_pixels());
    let mut map = MapDataset::new(
        "cta",
        log_edges(1.0, 10.0, 3),
        geom,
        Array2::zeros(shape),
        Array2::from_elem(shape, 1e12),
        Array2::from_elem(shape, 0.5),
    )?
    .with_psf_sigma(0.05)?
    .with_models(vec![blob]);
    map.fake(3)?;

    let points = FluxPointsDataset::new(
        "sed",
        Array1::from(vec![1.0, 3.0, 10.0]),
        Array1::from(vec![3.4e-11, 2.5e-12, 1.4e-13]),
        Array1::from(vec![3e-12, 3e-13, 0.0]),
        Array1::from(vec![false, false, true]),
    )?
    .with_models(vec![crab]);

    Datasets::from_vec(vec![
        Box::new(spectrum),
        Box::new(onoff),
        Box::new(map),
        Box::new(points),
    ])
}

#[test]
fn test_write_then_read() -> Result<()> {
    let datasets = mixed_datasets()?;
    let dir = scratch_dir("io");
    let files = datasets.write(&dir, "joint", false)?;
    assert_eq!(files.data.len(), 4);
    assert!(files.datasets.ends_with("joint_datasets.yaml"));
    assert!(files.models.ends_with("joint_models.yaml"));

    let read = Datasets::read(&files.datasets, &files.models)?;
    assert_eq!(read.names(), datasets.names());
    let tags: Vec<&str> = read.iter().map(|d| d.tag()).collect();
    assert_eq!(
        tags,
        vec!["SpectrumDataset", "SpectrumDatasetOnOff", "MapDataset", "FluxPointsDataset"]
    );

    let (expected, actual) = (datasets.stat_sum()?, read.stat_sum()?);
    assert!((actual - expected).abs() <= 1e-9 * expected.abs().max(1.0));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_read_shares_models() -> Result<()> {
    let datasets = mixed_datasets()?;
    let dir = scratch_dir("io_shared");
    let files = datasets.write(&dir, "joint", false)?;
    let read = Datasets::read(&files.datasets, &files.models)?;

    let hess = read.get("hess").unwrap().models()[0].clone();
    let sed = read.get("sed").unwrap().models()[0].clone();
    assert!(Arc::ptr_eq(&hess, &sed));

    // crab index and amplitude, blob index, amplitude, position and width
    assert_eq!(read.parameters().free().len(), 2 + 2 + 3);

    hess.parameters().get("index").unwrap().set_value(2.1);
    assert_eq!(sed.parameters().get("index").unwrap().value(), 2.1);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_read_missing_model() -> Result<()> {
    let datasets = mixed_datasets()?;
    let dir = scratch_dir("io_missing");
    let files = datasets.write(&dir, "joint", false)?;
    std::fs::write(&files.models, "components: []\n")?;
    assert!(Datasets::read(&files.datasets, &files.models).is_err());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_write_refuses_to_overwrite() -> Result<()> {
    let datasets = mixed_datasets()?;
    let dir = scratch_dir("io_overwrite");
    let files = datasets.write(&dir, "joint", false)?;
    let before = std::fs::read_to_string(&files.models)?;

    assert!(datasets.write(&dir, "joint", false).is_err());
    // Another prefix does not collide
    datasets.write(&dir, "other", false)?;

    hess_index(&datasets).set_value(2.0);
    datasets.write(&dir, "joint", true)?;
    let after = std::fs::read_to_string(&files.models)?;
    assert_ne!(before, after);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

fn hess_index(datasets: &Datasets) -> Parameter {
    datasets
        .get("hess")
        .unwrap()
        .parameters()
        .get("index")
        .unwrap()
        .clone()
}

#[test]
fn test_disk_and_shell_models_round_trip() -> Result<()> {
    let disk = Arc::new(
        SkyModel::new("snr", PowerLaw::new(2.3, 1e-12, 1.0))
            .with_spatial(DiskSpatial::new(0.1, 0.0, 0.2)?),
    );
    let shell = Arc::new(
        SkyModel::new("shell", PowerLaw::new(2.1, 5e-13, 1.0))
            .with_spatial(ShellSpatial::new(-0.1, 0.1, 0.15, 0.05)?),
    );
    let geom = MapGeom::centred(0.0, 0.0, 0.6, 0.1)?;
    let shape = (2, geom.n_pixels());
    let mut map = MapDataset::new(
        "cta",
        log_edges(1.0, 10.0, 2),
        geom,
        Array2::zeros(shape),
        Array2::from_elem(shape, 1e12),
        Array2::from_elem(shape, 0.2),
    )?
    .with_psf_sigma(0.05)?
    .with_models(vec![disk, shell]);
    map.fake(4)?;
    let datasets = Datasets::from_vec(vec![Box::new(map)])?;

    let dir = scratch_dir("io_extended");
    let files = datasets.write(&dir, "extended", false)?;
    let read = Datasets::read(&files.datasets, &files.models)?;
    let tags: Vec<&str> = read
        .get("cta")
        .unwrap()
        .models()
        .iter()
        .filter_map(|m| m.spatial().map(|s| s.tag()))
        .collect();
    assert_eq!(tags, vec!["DiskSpatial", "ShellSpatial"]);

    let (expected, actual) = (datasets.stat_sum()?, read.stat_sum()?);
    assert!((actual - expected).abs() <= 1e-9 * expected.abs().max(1.0));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
