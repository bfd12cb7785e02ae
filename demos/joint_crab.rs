use std::sync::Arc;

use anyhow::Result;
use gammafit::prelude::*;
use ndarray::{Array1, Array2};

fn main() -> Result<()> {
    let settings = settings::read("demos/joint_crab/config.toml")?;
    setup_log(&settings)?;

    // One Crab-like source, seen by three instruments
    let crab = Arc::new(
        SkyModel::new("crab", PowerLaw::new(2.5, 4e-11, 1.0))
            .with_spatial(PointSpatial::new(0.0, 0.0)),
    );
    let truth = crab.parameters().values();

    let edges = log_edges(0.5, 50.0, 16);
    let n = edges.len() - 1;
    let mut hess = SpectrumDataset::new(
        "hess",
        edges.clone(),
        Array1::zeros(n),
        Array1::from_elem(n, 2e13),
        Array1::from_elem(n, 3.0),
    )?
    .with_models(vec![crab.clone()]);
    hess.fake(11)?;

    let off_background = Array1::from_elem(n, 2.0);
    let mut magic = SpectrumDatasetOnOff::new(
        "magic",
        edges,
        Array1::zeros(n),
        &off_background * 4.0,
        Array1::from_elem(n, 0.25),
        Array1::from_elem(n, 1e13),
    )?
    .with_models(vec![crab.clone()]);
    magic.fake(&off_background, 12)?;

    let geom = MapGeom::centred(0.0, 0.0, 1.0, 0.1)?;
    let shape = (6, geom.n_pixels());
    let mut cta = MapDataset::new(
        "cta",
        log_edges(1.0, 100.0, 6),
        geom,
        Array2::zeros(shape),
        Array2::from_elem(shape, 5e13),
        Array2::from_elem(shape, 0.2),
    )?
    .with_psf_sigma(0.1)?
    .with_models(vec![crab.clone()]);
    cta.fake(13)?;

    let datasets = Datasets::from_vec(vec![Box::new(hess), Box::new(magic), Box::new(cta)])?;
    tracing::info!(
        "{} datasets, {} free parameters",
        datasets.len(),
        datasets.parameters().free().len()
    );

    crab.parameters().get("index").unwrap().set_value(2.0);
    crab.parameters().get("amplitude").unwrap().set_value(1e-11);

    let result = Fit::new(settings.clone()).run(&datasets)?;
    println!("{}", result);
    for (name, value) in crab.parameters().names().iter().zip(truth) {
        let fitted = crab.parameters().get(name).unwrap().value();
        println!("{:>10}: true {:.4e}, fitted {:.4e}", name, value, fitted);
    }

    let estimator = FluxPointsEstimator::new(log_edges(1.0, 50.0, 8), "crab", &settings)?;
    let points = estimator.run(&datasets)?;
    for point in points.iter() {
        if point.is_ul {
            println!("{:>8.2} TeV  dnde < {:.3e}", point.e_ref, point.norm_ul * point.ref_dnde);
        } else {
            println!(
                "{:>8.2} TeV  dnde = {:.3e} (sqrt(ts) = {:.1})",
                point.e_ref,
                point.dnde(),
                point.sqrt_ts()
            );
        }
    }

    if settings.output.write {
        result.write_csv(&settings.output.path)?;
        points.write_csv(&settings.output.path)?;
        datasets.write(&settings.output.path, "joint_crab", true)?;
    }
    Ok(())
}
