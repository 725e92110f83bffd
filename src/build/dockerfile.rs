//! Dockerfile generation for dependency and program layers
//! 依赖层和程序层的Dockerfile生成

use std::collections::BTreeMap;

use crate::services::program::{DependencySpec, PackageRef, ProgramAsset};

/// Resolve the base image for an interpreter version / 解析解释器版本对应的基础镜像
pub fn base_image<'a>(
    base_images: &'a BTreeMap<String, String>,
    interpreter: Option<&str>,
    default_interpreter: &'a str,
) -> &'a str {
    let version = interpreter.unwrap_or(default_interpreter);
    base_images
        .get(version)
        .or_else(|| base_images.get(default_interpreter))
        .map(|s| s.as_str())
        .unwrap_or("mellea-python:3.12")
}

/// Requirement lines in canonical order. Ordering is part of the cache
/// identity and must not change.
/// 规范顺序的需求行。顺序是缓存标识的一部分，不得改变。
pub fn requirements_lines(deps: &DependencySpec) -> Vec<String> {
    let mut packages: Vec<&PackageRef> = deps.packages.iter().collect();
    packages.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    packages.iter().map(|pkg| pkg.requirement_line()).collect()
}

/// Dockerfile and requirements file for the dependency layer
/// 依赖层的Dockerfile和需求文件
pub fn generate_deps_dockerfile(
    deps: &DependencySpec,
    base_images: &BTreeMap<String, String>,
    default_interpreter: &str,
) -> (String, String) {
    let base = base_image(
        base_images,
        deps.interpreter_version.as_deref(),
        default_interpreter,
    );

    let requirements = requirements_lines(deps).join("\n");

    let dockerfile = format!(
        "# syntax=docker/dockerfile:1\n\
         # Mellea Dependency Layer\n\
         # Auto-generated - do not edit manually\n\
         \n\
         FROM {base}\n\
         \n\
         # Install dependencies\n\
         WORKDIR /app\n\
         \n\
         COPY requirements.txt /tmp/requirements.txt\n\
         RUN --mount=type=cache,target=/root/.cache/pip \\\n\
         \x20   pip install -r /tmp/requirements.txt && \\\n\
         \x20   rm /tmp/requirements.txt\n"
    );

    (dockerfile, requirements)
}

/// Dockerfile for the program layer on top of a dependency image
/// 依赖镜像之上程序层的Dockerfile
pub fn generate_program_dockerfile(program: &ProgramAsset, deps_image_tag: &str) -> String {
    format!(
        "# Mellea Program Image\n\
         # Program: {name} ({id})\n\
         # Auto-generated - do not edit manually\n\
         \n\
         FROM {deps_image_tag}\n\
         \n\
         # Copy program source code\n\
         COPY . /app/\n\
         \n\
         # Set working directory\n\
         WORKDIR /app\n\
         \n\
         # Set entrypoint\n\
         ENV MELLEA_ENTRYPOINT=\"{entrypoint}\"\n\
         \n\
         # Default command runs the entrypoint\n\
         CMD [\"python\", \"{entrypoint}\"]\n",
        name = program.name,
        id = program.id,
        entrypoint = program.entrypoint,
    )
}

/// Single-stage Dockerfile for Kaniko builds. Without a shared daemon the
/// two-layer split buys nothing, so deps and source land in one image.
/// Kaniko构建的单阶段Dockerfile。没有共享守护进程时两层拆分没有收益，
/// 因此依赖和源码放在一个镜像中。
pub fn generate_kaniko_dockerfile(
    program: &ProgramAsset,
    base_images: &BTreeMap<String, String>,
    default_interpreter: &str,
) -> String {
    let base = base_image(
        base_images,
        program.dependencies.interpreter_version.as_deref(),
        default_interpreter,
    );

    let requirements = requirements_lines(&program.dependencies).join("\\n");

    format!(
        "# Mellea Program Image (Kaniko Build)\n\
         # Program: {name} ({id})\n\
         # Auto-generated - do not edit manually\n\
         \n\
         FROM {base}\n\
         \n\
         WORKDIR /app\n\
         \n\
         # Install dependencies\n\
         RUN printf '%b' \"{requirements}\" > /tmp/requirements.txt && \\\n\
         \x20   pip install --no-cache-dir -r /tmp/requirements.txt && \\\n\
         \x20   rm /tmp/requirements.txt\n\
         \n\
         # Copy program source code\n\
         COPY . /app/\n\
         \n\
         # Set entrypoint\n\
         ENV MELLEA_ENTRYPOINT=\"{entrypoint}\"\n\
         \n\
         # Default command runs the entrypoint\n\
         CMD [\"python\", \"{entrypoint}\"]\n",
        name = program.name,
        id = program.id,
        entrypoint = program.entrypoint,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::program::{DependencySource, ImageBuildStatus};
    use chrono::Utc;

    fn deps() -> DependencySpec {
        DependencySpec {
            source: DependencySource::Manual,
            packages: vec![
                PackageRef::pinned("requests", "2.31.0"),
                PackageRef::pinned("Pydantic", "2.5.0"),
            ],
            interpreter_version: Some("3.12".to_string()),
        }
    }

    fn base_images_map() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("3.11".to_string(), "mellea-python:3.11".to_string());
        map.insert("3.12".to_string(), "mellea-python:3.12".to_string());
        map
    }

    fn program() -> ProgramAsset {
        let now = Utc::now();
        ProgramAsset {
            id: "prog-12345678".to_string(),
            owner_id: "user-1".to_string(),
            name: "demo".to_string(),
            entrypoint: "main.py".to_string(),
            project_root: ".".to_string(),
            dependencies: deps(),
            image_tag: None,
            image_build_status: ImageBuildStatus::Pending,
            image_build_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_requirements_sorted_by_lowercased_name() {
        let lines = requirements_lines(&deps());
        assert_eq!(lines, vec!["Pydantic==2.5.0", "requests==2.31.0"]);
    }

    #[test]
    fn test_deps_dockerfile_contents() {
        let (dockerfile, requirements) =
            generate_deps_dockerfile(&deps(), &base_images_map(), "3.12");

        assert!(dockerfile.starts_with("# syntax=docker/dockerfile:1"));
        assert!(dockerfile.contains("FROM mellea-python:3.12"));
        assert!(dockerfile.contains("--mount=type=cache,target=/root/.cache/pip"));
        assert_eq!(requirements, "Pydantic==2.5.0\nrequests==2.31.0");
    }

    #[test]
    fn test_unknown_interpreter_falls_back_to_default() {
        let mut spec = deps();
        spec.interpreter_version = Some("2.7".to_string());
        let (dockerfile, _) = generate_deps_dockerfile(&spec, &base_images_map(), "3.12");
        assert!(dockerfile.contains("FROM mellea-python:3.12"));
    }

    #[test]
    fn test_program_dockerfile_contents() {
        let dockerfile = generate_program_dockerfile(&program(), "mellea-deps:abc123def456");
        assert!(dockerfile.contains("FROM mellea-deps:abc123def456"));
        assert!(dockerfile.contains("COPY . /app/"));
        assert!(dockerfile.contains("ENV MELLEA_ENTRYPOINT=\"main.py\""));
        assert!(dockerfile.contains("CMD [\"python\", \"main.py\"]"));
    }

    #[test]
    fn test_kaniko_dockerfile_is_single_stage() {
        let dockerfile = generate_kaniko_dockerfile(&program(), &base_images_map(), "3.12");
        assert!(dockerfile.contains("FROM mellea-python:3.12"));
        assert!(dockerfile.contains("pip install --no-cache-dir"));
        assert!(dockerfile.contains("COPY . /app/"));
        // Requirements inline, newline-escaped / 需求内联，换行转义
        assert!(dockerfile.contains("Pydantic==2.5.0\\nrequests==2.31.0"));
    }
}
