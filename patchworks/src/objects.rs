//! Plain object store access: `create`, `get` and `delete`.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use patchworks_core::{NamespacedName, Object, ObjectKey};
use patchworks_store::ObjectStore;

use crate::{application, manifest, options::Options};

#[derive(clap::Parser, Debug)]
pub(crate) struct CreateArgs {
    /// Manifest files to read objects from, `-` for standard input
    #[arg(short = 'f', long = "filename", required = true)]
    files: Vec<PathBuf>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, Default)]
pub(crate) enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Addresses one object.
#[derive(clap::Parser, Debug)]
pub(crate) struct ObjectArgs {
    /// For example `v1` or `apps/v1`
    api_version: String,
    /// For example `ConfigMap`
    kind: String,
    /// `NAMESPACE/NAME`, or `NAME` in the default namespace
    name: NamespacedName,
}

impl ObjectArgs {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.name.namespace.clone(),
            self.name.name.clone(),
        )
    }
}

#[derive(clap::Parser, Debug)]
pub(crate) struct GetArgs {
    #[command(flatten)]
    object: ObjectArgs,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
}

pub(crate) async fn create(options: &Options, args: &CreateArgs) -> Result<()> {
    let mut objects = Vec::new();
    for path in &args.files {
        objects.extend(manifest::read(path)?);
    }
    let store = application::open_store(options)?;
    for object in objects {
        let key = object.key()?;
        store
            .create(object)
            .await
            .with_context(|| format!("creating {}", key))?;
        println!("{} created", key);
    }
    Ok(())
}

pub(crate) fn format_object(object: &Object, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(object)?,
        OutputFormat::Json => serde_json::to_string_pretty(object)? + "\n",
    })
}

pub(crate) async fn get(options: &Options, args: &GetArgs) -> Result<()> {
    let store = application::open_store(options)?;
    let key = args.object.key();
    let object = store
        .get(&key)
        .await
        .with_context(|| format!("getting {}", key))?;
    print!("{}", format_object(&object, args.output)?);
    Ok(())
}

pub(crate) async fn delete(options: &Options, args: &ObjectArgs) -> Result<()> {
    let store = application::open_store(options)?;
    let key = args.key();
    match store
        .delete(&key)
        .await
        .with_context(|| format!("deleting {}", key))?
    {
        None => println!("{} deleted", key),
        Some(object) => println!(
            "{} marked for deletion, waiting for finalizers: {}",
            key,
            object.finalizers().join(", ")
        ),
    }
    Ok(())
}
