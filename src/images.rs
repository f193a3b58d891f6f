use crate::{
    logs::Reporter,
    runtime::{ContainerRuntime, ImageRef},
    Error, Result,
};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;

/// Dockerfile for the application image when no build context is configured.
///
/// WordPress on Apache with the CLI tools the snapshot pull needs.
pub const APPLICATION_DOCKERFILE: &str = r#"
FROM wordpress:php7.4-apache
RUN apt-get update && \
    apt-get install -y --no-install-recommends \
        git \
        unzip \
        default-mysql-client \
        && rm -rf /var/lib/apt/lists/*
RUN curl -sS https://getcomposer.org/installer | php -- --install-dir=/usr/local/bin --filename=composer
RUN curl -sSo /usr/local/bin/wp https://raw.githubusercontent.com/wp-cli/builds/gh-pages/phar/wp-cli.phar && \
    chmod +x /usr/local/bin/wp
ENV PATH="/root/.composer/vendor/bin:${PATH}"
RUN composer global require 10up/wpsnapshots
RUN mkdir -p /root/repo /root/.wpsnapshots
"#;

/// Makes sure every image an environment needs exists locally
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Reporter,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, reporter: Reporter) -> Self {
        Self { runtime, reporter }
    }

    /// Pull every image that is missing, one after another.
    ///
    /// The first failure aborts; nothing is retried.
    pub async fn ensure_images(&self, images: &[ImageRef]) -> Result<()> {
        for image in images {
            let reference = image.to_string();
            let present = self
                .runtime
                .image_exists(&reference)
                .await
                .map_err(|e| Error::ImagePull {
                    image: reference.clone(),
                    reason: e.to_string(),
                })?;
            if present {
                tracing::debug!(image = %reference, "Image already present");
                continue;
            }

            self.reporter.info(1, format!("Pulling {}...", reference));
            let mut stream = self.runtime.pull_image(image);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(line) => tracing::debug!(image = %reference, "Pull: {}", line),
                    Err(e) => {
                        return Err(Error::ImagePull {
                            image: reference,
                            reason: e.to_string(),
                        })
                    }
                }
            }
            self.reporter.success(1, format!("Pulled {}", reference));
        }
        Ok(())
    }

    /// Build the application image unless it exists already (or `rebuild` is set).
    ///
    /// With no `context_dir` the embedded [`APPLICATION_DOCKERFILE`] is used.
    pub async fn ensure_built(
        &self,
        image: &ImageRef,
        context_dir: Option<&Path>,
        rebuild: bool,
    ) -> Result<()> {
        let tag = image.to_string();

        if !rebuild
            && self
                .runtime
                .image_exists(&tag)
                .await
                .map_err(|e| Error::ImageBuild {
                    image: tag.clone(),
                    reason: e.to_string(),
                })?
        {
            tracing::debug!(image = %tag, "Application image already exists");
            return Ok(());
        }

        let context = match context_dir {
            Some(dir) => tar_directory(dir),
            None => tar_dockerfile(APPLICATION_DOCKERFILE),
        }
        .map_err(|e| Error::ImageBuild {
            image: tag.clone(),
            reason: format!("failed to pack build context: {}", e),
        })?;

        self.reporter.info(1, format!("Building {}...", tag));

        let mut stream = self.runtime.build_image(&tag, context);
        while let Some(result) = stream.next().await {
            match result {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => self.reporter.info(3, line.trim().to_string()),
                Err(e) => {
                    return Err(Error::ImageBuild {
                        image: tag,
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.reporter.success(1, format!("Built {}", tag));
        Ok(())
    }
}

fn tar_dockerfile(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut tar_builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder.append(&header, dockerfile.as_bytes())?;
    tar_builder.into_inner()
}

fn tar_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    if !dir.join("Dockerfile").is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no Dockerfile in {}", dir.display()),
        ));
    }
    let mut tar_builder = tar::Builder::new(Vec::new());
    tar_builder.follow_symlinks(false);
    tar_builder.append_dir_all(".", dir)?;
    tar_builder.into_inner()
}
