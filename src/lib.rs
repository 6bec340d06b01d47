#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod config;
pub mod daily_shading;
pub mod engine;
pub mod error;
pub mod grid;
pub mod irradiance;
pub mod metdata;
pub mod pipeline;
pub mod progress;
pub mod roof_planes;
pub mod roofs;
pub mod shadowing;
pub mod sky_patches;
pub mod sun_position;
pub mod terrain;
pub mod wall_aspect;
pub mod walls;

pub use error::{Result, SolarError};

#[cfg(feature = "python")]
#[pymodule]
fn rooftop_solar(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    register_walls_module(py_module)?;
    register_wall_aspect_module(py_module)?;
    register_shadowing_module(py_module)?;
    register_sky_module(py_module)?;
    register_daily_shading_module(py_module)?;
    register_irradiance_module(py_module)?;
    register_roofs_module(py_module)?;

    py_module.add("__doc__", "Rooftop solar PV potential algorithms implemented in Rust.")?;

    Ok(())
}

#[cfg(feature = "python")]
fn register_walls_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "walls")?;
    submodule.add("__doc__", "Wall detection.")?;
    submodule.add_function(wrap_pyfunction!(walls::find_walls_py, &submodule)?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_wall_aspect_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "wall_aspect")?;
    submodule.add("__doc__", "Wall aspect detection.")?;
    submodule.add_function(wrap_pyfunction!(wall_aspect::compute_wall_aspect, &submodule)?)?;
    submodule.add_class::<wall_aspect::WallAspectRunner>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_shadowing_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "shadowing")?;
    submodule.add("__doc__", "Shadow casting on surfaces and walls.")?;
    submodule.add_function(wrap_pyfunction!(shadowing::cast_shadows_py, &submodule)?)?;
    submodule.add_function(wrap_pyfunction!(shadowing::cast_wall_shadows_py, &submodule)?)?;
    submodule.add_class::<shadowing::WallShading>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_sky_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "sky")?;
    submodule.add("__doc__", "Sky patch irradiance table.")?;
    submodule.add_function(wrap_pyfunction!(sky_patches::sky_irradiance_table, &submodule)?)?;
    submodule.add("PATCH_COUNT", sky_patches::PATCH_COUNT)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_daily_shading_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "daily_shading")?;
    submodule.add("__doc__", "Seasonal shadow composite.")?;
    submodule.add_class::<daily_shading::SeasonalShadowRunner>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_irradiance_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "irradiance")?;
    submodule.add("__doc__", "Annual irradiance accumulation.")?;
    submodule.add_class::<irradiance::SolarEnergyRunner>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_roofs_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "roofs")?;
    submodule.add("__doc__", "Roof suitability and panel yield.")?;
    submodule.add_function(wrap_pyfunction!(roofs::assess_roof_py, &submodule)?)?;
    submodule.add_function(wrap_pyfunction!(roofs::round_sig_py, &submodule)?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
