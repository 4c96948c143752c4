//! Rendering job documents.
//!
//! Job documents are templates: values only known once a machine has been
//! picked are substituted before the document is parsed.
//!
//! | Variable | Value |
//! |----------|-------|
//! | `machine_id` | Id of the machine running the job |
//! | `machine_tags` | Its tags |
//! | `local_tty_device` | Its console device, if known |
//! | `job_bucket.name` / `.url` / `.access_key` / `.secret_key` | The job bucket |

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

/// Values available to a job template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobContext {
    pub machine_id: String,
    pub machine_tags: Vec<String>,
    pub local_tty_device: String,
    pub job_bucket: Option<BucketContext>,
}

/// Credentials of the job bucket, as exposed to templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketContext {
    pub name: String,
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Renders `template`, failing on any undefined variable.
pub fn render(template: &str, context: &JobContext) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("job", template)?;
    env.get_template("job")?.render(context)
}

/// Renders `template` without a machine, turning every variable into an
/// empty value. Used to read the target before a machine is chosen.
pub fn render_lenient(template: &str) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.add_template("job", template)?;
    env.get_template("job")?.render(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> JobContext {
        JobContext {
            machine_id: "52:54:00:00:00:01".to_string(),
            machine_tags: vec!["gpu".to_string(), "x86".to_string()],
            local_tty_device: "ttyUSB0".to_string(),
            job_bucket: Some(BucketContext {
                name: "job-1".to_string(),
                url: "file:///srv/jobs/job-1".to_string(),
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
            }),
        }
    }

    #[test]
    fn test_render_substitutes_machine_values() {
        let rendered = render(
            "id: {{ machine_id }} tty={{ local_tty_device }} {{ machine_tags | join(',') }}",
            &context(),
        )
        .unwrap();
        assert_eq!(rendered, "id: 52:54:00:00:00:01 tty=ttyUSB0 gpu,x86");
    }

    #[test]
    fn test_render_exposes_bucket() {
        let rendered = render("{{ job_bucket.url }} {{ job_bucket.access_key }}", &context()).unwrap();
        assert_eq!(rendered, "file:///srv/jobs/job-1 ak");
    }

    #[test]
    fn test_strict_render_rejects_unknown_variables() {
        assert!(render("{{ nope }}", &context()).is_err());
    }

    #[test]
    fn test_lenient_render_blanks_variables() {
        let rendered = render_lenient("a={{ machine_id }} b={{ job_bucket.url }}").unwrap();
        assert_eq!(rendered, "a= b=");
    }
}
