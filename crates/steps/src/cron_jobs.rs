//! Scheduled jobs: either a command run in the Capsule's pod template or an
//! HTTP call against the Capsule's own service.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use capsule_core::capsule::{CronJob as JobSpecification, JobCommand, JobUrl};
use capsule_core::{Capsule, LABEL_CAPSULE};
use capsule_pipeline::{gvk_for, Request, RequestExt, Step};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use url::Url;

/// Label carrying the job name on a cron job and its pods.
pub const LABEL_CRON_JOB: &str = "capsule.dev/cron-job";

pub(crate) const CURL_IMAGE: &str = "quay.io/curl/curl:latest";
const DEFAULT_MAX_RETRIES: u32 = 6;

pub struct CronJobsStep;

#[async_trait]
impl Step for CronJobsStep {
    fn name(&self) -> &str {
        "cron-jobs"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        let capsule = req.capsule().clone();
        if capsule.spec.cron_jobs.is_empty() {
            return Ok(());
        }
        let key = req.key(gvk_for::<Deployment>());
        let deployment: Option<Deployment> = req.new_as(&key)?;
        let template = deployment.and_then(|d| d.spec).map(|s| s.template);

        for job in &capsule.spec.cron_jobs {
            let cron = build(&capsule, job, template.as_ref()).with_context(|| format!("cron job '{}'", job.name))?;
            req.set_object(&cron)?;
        }
        Ok(())
    }
}

fn build(capsule: &Capsule, job: &JobSpecification, template: Option<&PodTemplateSpec>) -> Result<CronJob> {
    let name = capsule.name_any();
    let labels = BTreeMap::from([
        (LABEL_CAPSULE.to_string(), name.clone()),
        (LABEL_CRON_JOB.to_string(), job.name.clone()),
    ]);

    let mut pod = match (&job.command, &job.url) {
        (Some(cmd), None) => command_pod(capsule, cmd, template)?,
        (None, Some(u)) => url_pod(capsule, job, u)?,
        (Some(_), Some(_)) => bail!("only one of command or url can be set"),
        (None, None) => bail!("neither command nor url is set"),
    };
    let pod_meta = pod.metadata.get_or_insert_with(ObjectMeta::default);
    pod_meta.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
    if let Some(spec) = pod.spec.as_mut() {
        spec.restart_policy = Some("Never".into());
    }

    Ok(CronJob {
        metadata: ObjectMeta { name: Some(format!("{name}-{}", job.name)), labels: Some(labels), ..Default::default() },
        spec: Some(CronJobSpec {
            schedule: job.schedule.clone(),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: pod,
                    active_deadline_seconds: job.timeout_seconds.map(i64::from),
                    backoff_limit: Some(i32::try_from(job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)).unwrap_or(i32::MAX)),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The deployment's pod template with the container command swapped.
fn command_pod(capsule: &Capsule, cmd: &JobCommand, template: Option<&PodTemplateSpec>) -> Result<PodTemplateSpec> {
    let name = capsule.name_any();
    let mut pod = template.cloned().context("no deployment to take the pod template from")?;
    let container = pod
        .spec
        .as_mut()
        .and_then(|s| s.containers.iter_mut().find(|c| c.name == name))
        .with_context(|| format!("pod template has no container named '{name}'"))?;
    container.command = Some(vec![cmd.command.clone()]);
    container.args = (!cmd.args.is_empty()).then(|| cmd.args.clone());
    container.liveness_probe = None;
    container.readiness_probe = None;
    Ok(pod)
}

fn url_pod(capsule: &Capsule, job: &JobSpecification, u: &JobUrl) -> Result<PodTemplateSpec> {
    let url = job_url(&capsule.name_any(), u)?;
    let mut args = vec!["-G".to_string(), "--fail-with-body".to_string()];
    if let Some(t) = job.timeout_seconds {
        args.extend(["--max-time".to_string(), t.to_string()]);
    }
    args.push(url.to_string());
    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta::default()),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: job.name.clone(),
                image: Some(CURL_IMAGE.into()),
                args: Some(args),
                ..Default::default()
            }],
            ..Default::default()
        }),
    })
}

fn job_url(service: &str, u: &JobUrl) -> Result<Url> {
    let mut url = Url::parse(&format!("http://{service}:{}", u.port)).with_context(|| format!("service url for '{service}'"))?;
    url.set_path(&u.path);
    if !u.query_parameters.is_empty() {
        url.query_pairs_mut().extend_pairs(u.query_parameters.iter());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing, DeploymentStep};
    use capsule_core::{CapsuleSpec, OperatorConfig};

    fn url_job() -> JobSpecification {
        JobSpecification {
            name: "cleanup".into(),
            schedule: "*/5 * * * *".into(),
            url: Some(JobUrl {
                port: 8080,
                path: "/jobs/cleanup".into(),
                query_parameters: BTreeMap::from([("dry".to_string(), "false".to_string())]),
            }),
            timeout_seconds: Some(30),
            ..Default::default()
        }
    }

    fn command_job() -> JobSpecification {
        JobSpecification {
            name: "migrate".into(),
            schedule: "0 3 * * *".into(),
            command: Some(JobCommand { command: "/bin/migrate".into(), args: vec!["up".into()] }),
            max_retries: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn url_is_built_against_the_service() {
        let url = job_url("web", url_job().url.as_ref().unwrap()).unwrap();
        assert_eq!(url.as_str(), "http://web:8080/jobs/cleanup?dry=false");
    }

    #[test]
    fn url_job_runs_curl() {
        let c = testing::capsule(CapsuleSpec { image: "app".into(), ..Default::default() });
        let cron = build(&c, &url_job(), None).unwrap();
        assert_eq!(cron.metadata.name.as_deref(), Some("web-cleanup"));
        let spec = cron.spec.unwrap();
        assert_eq!(spec.schedule, "*/5 * * * *");
        let job = spec.job_template.spec.unwrap();
        assert_eq!(job.active_deadline_seconds, Some(30));
        assert_eq!(job.backoff_limit, Some(6));
        let pod = job.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers[0].image.as_deref(), Some(CURL_IMAGE));
        assert_eq!(pod.containers[0].args.as_ref().unwrap().last().unwrap(), "http://web:8080/jobs/cleanup?dry=false");
        let labels = job.template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels[LABEL_CRON_JOB], "cleanup");
    }

    #[test]
    fn job_needs_exactly_one_action() {
        let c = testing::capsule(CapsuleSpec::default());
        let mut job = url_job();
        job.url = None;
        assert!(build(&c, &job, None).unwrap_err().to_string().contains("neither command nor url"));
        let mut job = command_job();
        job.url = url_job().url;
        assert!(build(&c, &job, None).is_err());
    }

    #[tokio::test]
    async fn command_job_reuses_pod_template() {
        let spec = CapsuleSpec { image: "app:v2".into(), cron_jobs: vec![command_job()], ..Default::default() };
        let mut req = testing::request(testing::capsule(spec), OperatorConfig::default());
        DeploymentStep.apply(&mut req).await.unwrap();
        CronJobsStep.apply(&mut req).await.unwrap();

        let cron: CronJob = req.new_as(&req.named_key("web-migrate", gvk_for::<CronJob>())).unwrap().unwrap();
        let job = cron.spec.unwrap().job_template.spec.unwrap();
        assert_eq!(job.backoff_limit, Some(1));
        let pod = job.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("web"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let c = &pod.containers[0];
        assert_eq!(c.image.as_deref(), Some("app:v2"));
        assert_eq!(c.command.as_deref(), Some(&["/bin/migrate".to_string()][..]));
        assert_eq!(c.args.as_deref(), Some(&["up".to_string()][..]));
    }

    #[tokio::test]
    async fn command_job_without_deployment_fails() {
        let spec = CapsuleSpec { cron_jobs: vec![command_job()], ..Default::default() };
        let mut req = testing::request(testing::capsule(spec), OperatorConfig::default());
        let err = CronJobsStep.apply(&mut req).await.unwrap_err();
        assert!(format!("{err:#}").contains("no deployment"));
    }
}
