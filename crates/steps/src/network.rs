//! Exposes the Capsule's interfaces: container ports and probes on the
//! deployment, a Service in front of it, and the public entry points.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use capsule_core::capsule::{CapsuleInterface, InterfaceProbe};
use capsule_core::Capsule;
use capsule_pipeline::{gvk_for, Request, RequestExt, Step};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ContainerPort, GRPCAction, HTTPGetAction, Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;

use crate::selector_labels;

pub struct NetworkStep;

#[async_trait]
impl Step for NetworkStep {
    fn name(&self) -> &str {
        "network"
    }

    async fn apply(&self, req: &mut dyn Request) -> Result<()> {
        let capsule = req.capsule().clone();
        if capsule.spec.interfaces.is_empty() {
            return Ok(());
        }
        let key = req.key(gvk_for::<Deployment>());
        let Some(mut deployment) = req.new_as::<Deployment>(&key)? else {
            debug!("no deployment to expose");
            return Ok(());
        };
        inject_interfaces(&capsule, &mut deployment)?;
        req.set_object(&deployment)?;

        let service_type = req.config().service.r#type.clone();
        req.set_object(&service(&capsule, &service_type))?;
        if let Some(lb) = load_balancer(&capsule) {
            req.set_object(&lb)?;
        }

        let ingress_config = req.config().ingress.clone();
        for iface in &capsule.spec.interfaces {
            let Some(public) = iface.public.as_ref().and_then(|p| p.ingress.as_ref()) else {
                continue;
            };
            if ingress_config.disabled {
                bail!("interface '{}' asks for an ingress but ingresses are disabled", iface.name);
            }
            req.set_object(&ingress(&capsule, iface, &public.host, &public.path_prefixes, ingress_config.class_name.clone()))?;
        }
        Ok(())
    }
}

fn inject_interfaces(capsule: &Capsule, deployment: &mut Deployment) -> Result<()> {
    let name = capsule.name_any();
    let container = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.iter_mut().find(|c| c.name == name))
        .with_context(|| format!("deployment has no container named '{name}'"))?;

    let mut ports = Vec::with_capacity(capsule.spec.interfaces.len());
    for iface in &capsule.spec.interfaces {
        ports.push(ContainerPort { name: Some(iface.name.clone()), container_port: iface.port, ..Default::default() });
        if let Some(p) = &iface.liveness {
            container.liveness_probe = Some(probe(iface, p)?);
        }
        if let Some(p) = &iface.readiness {
            container.readiness_probe = Some(probe(iface, p)?);
        }
    }
    container.ports = Some(ports);
    Ok(())
}

fn probe(iface: &CapsuleInterface, p: &InterfaceProbe) -> Result<Probe> {
    let mut probe = Probe::default();
    match (&p.path, p.tcp, &p.grpc) {
        (Some(path), false, None) => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(iface.port),
                ..Default::default()
            });
        }
        (None, true, None) => {
            probe.tcp_socket = Some(TCPSocketAction { port: IntOrString::Int(iface.port), ..Default::default() });
        }
        (None, false, Some(grpc)) => {
            probe.grpc = Some(GRPCAction {
                port: iface.port,
                service: (!grpc.service.is_empty()).then(|| grpc.service.clone()),
            });
        }
        _ => bail!("probe on interface '{}' must set exactly one of path, tcp or grpc", iface.name),
    }
    Ok(probe)
}

fn service(capsule: &Capsule, service_type: &str) -> Service {
    let ports = capsule
        .spec
        .interfaces
        .iter()
        .map(|i| service_port(&i.name, i.port))
        .collect();
    Service {
        metadata: ObjectMeta { name: Some(capsule.name_any()), ..Default::default() },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(selector_labels(capsule)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One `LoadBalancer` service carrying every load-balanced interface.
fn load_balancer(capsule: &Capsule) -> Option<Service> {
    let ports: Vec<ServicePort> = capsule
        .spec
        .interfaces
        .iter()
        .filter_map(|i| {
            let lb = i.public.as_ref()?.load_balancer.as_ref()?;
            Some(service_port(&i.name, lb.port))
        })
        .collect();
    if ports.is_empty() {
        return None;
    }
    Some(Service {
        metadata: ObjectMeta { name: Some(format!("{}-lb", capsule.name_any())), ..Default::default() },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            selector: Some(selector_labels(capsule)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        ..Default::default()
    }
}

fn ingress(
    capsule: &Capsule,
    iface: &CapsuleInterface,
    host: &str,
    prefixes: &[String],
    class_name: Option<String>,
) -> Ingress {
    let name = capsule.name_any();
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: name.clone(),
            port: Some(ServiceBackendPort { name: Some(iface.name.clone()), number: None }),
        }),
        ..Default::default()
    };
    let prefixes: Vec<&str> = if prefixes.is_empty() {
        vec!["/"]
    } else {
        prefixes.iter().map(String::as_str).collect()
    };
    let paths = prefixes
        .into_iter()
        .map(|p| HTTPIngressPath { path: Some(p.to_string()), path_type: "Prefix".into(), backend: backend.clone() })
        .collect();
    Ingress {
        metadata: ObjectMeta { name: Some(format!("{name}-{}", iface.name)), ..Default::default() },
        spec: Some(IngressSpec {
            ingress_class_name: class_name,
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
