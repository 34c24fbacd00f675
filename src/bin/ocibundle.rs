use clap::Parser;
use ocibundle::config_edit::{rewrite_config, ConfigChanges};
use ocibundle::error::Result;
use ocibundle::idmap::{IdMapping, MapOptions};
use ocibundle::{create_image, repack::repack, unpack::unpack, RefName};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(version, about = "Manipulate OCI images at rest")]
enum Opt {
    /// Create an empty image repository, optionally with an empty
    /// tagged image in it
    Create {
        /// Path of the repository to create
        #[arg(long = "image")]
        image: PathBuf,

        /// Reference name for an empty image
        #[arg(short = 't', long = "tag")]
        tag: Option<String>,
    },

    /// Unpack an image into a runtime bundle
    Unpack {
        /// Path of the image repository
        #[arg(long = "image")]
        image: PathBuf,

        /// Reference of the image to unpack
        #[arg(long = "from")]
        from: String,

        /// Path of the bundle to create
        #[arg(long = "bundle")]
        bundle: PathBuf,

        #[command(flatten)]
        mapping: MappingArgs,
    },

    /// Repack a bundle's changes into the image as a new layer
    Repack {
        /// Path of the image repository
        #[arg(long = "image")]
        image: PathBuf,

        /// Reference the bundle was unpacked from
        #[arg(long = "from")]
        from: String,

        /// Path of the bundle to repack
        #[arg(long = "bundle")]
        bundle: PathBuf,

        /// Reference to bind the repacked manifest to
        #[arg(short = 't', long = "tag")]
        tag: Option<String>,

        #[command(flatten)]
        mapping: MappingArgs,
    },

    /// Modify an image's configuration
    Config {
        /// Path of the image repository
        #[arg(long = "image")]
        image: PathBuf,

        /// Reference of the image to modify
        #[arg(long = "from")]
        from: String,

        /// Reference to bind the modified image to; defaults to `from`
        #[arg(short = 't', long = "tag")]
        tag: Option<String>,

        /// `uid[:gid]` the container process runs as
        #[arg(long = "config.user")]
        user: Option<String>,

        /// Environment entry to append (repeatable)
        #[arg(long = "config.env")]
        env: Vec<String>,

        /// Working directory of the container process
        #[arg(long = "config.workingdir")]
        workingdir: Option<String>,

        /// Entrypoint argument (repeatable, replaces the previous list)
        #[arg(long = "config.entrypoint")]
        entrypoint: Vec<String>,

        /// Command argument (repeatable, replaces the previous list)
        #[arg(long = "config.cmd")]
        cmd: Vec<String>,
    },
}

#[derive(Debug, clap::Args)]
struct MappingArgs {
    /// Uid mapping `container:host:length` (repeatable)
    #[arg(long = "uid-map")]
    uid_map: Vec<String>,

    /// Gid mapping `container:host:length` (repeatable)
    #[arg(long = "gid-map")]
    gid_map: Vec<String>,

    /// Operate without privileges; ownership is neither recorded nor
    /// restored
    #[arg(long = "rootless")]
    rootless: bool,
}

impl MappingArgs {
    fn into_options(self) -> Result<MapOptions> {
        let parse = |specs: Vec<String>| -> Result<Vec<IdMapping>> {
            specs.iter().map(|s| IdMapping::parse(s)).collect()
        };
        Ok(MapOptions::new(
            self.rootless,
            parse(self.uid_map)?,
            parse(self.gid_map)?,
        ))
    }
}

fn run() -> Result<()> {
    match Opt::parse() {
        Opt::Create { image, tag } => {
            let tag = tag.as_deref().map(RefName::new).transpose()?;
            create_image(&image, tag.as_ref())?;
        }

        Opt::Unpack {
            image,
            from,
            bundle,
            mapping,
        } => {
            let from = RefName::new(&from)?;
            unpack(&image, &from, &bundle, &mapping.into_options()?)?;
        }

        Opt::Repack {
            image,
            from,
            bundle,
            tag,
            mapping,
        } => {
            let from = RefName::new(&from)?;
            let tag = tag.as_deref().map(RefName::new).transpose()?;
            repack(
                &image,
                &from,
                &bundle,
                tag.as_ref(),
                &mapping.into_options()?,
            )?;
        }

        Opt::Config {
            image,
            from,
            tag,
            user,
            env,
            workingdir,
            entrypoint,
            cmd,
        } => {
            let from = RefName::new(&from)?;
            let tag = tag.as_deref().map(RefName::new).transpose()?;
            let changes = ConfigChanges {
                user,
                env,
                working_dir: workingdir,
                entrypoint: (!entrypoint.is_empty()).then_some(entrypoint),
                cmd: (!cmd.is_empty()).then_some(cmd),
            };
            rewrite_config(&image, &from, tag.as_ref(), &changes)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
