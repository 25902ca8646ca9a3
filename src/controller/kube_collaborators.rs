//! Kubernetes-backed collaborators.
//!
//! Policies, placements, managed clusters and the per-cluster views and
//! actions are Open Cluster Management resources, accessed as
//! `DynamicObject`s. Raw JSON is turned into the engine's typed values here
//! and nowhere else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::controller::collaborators::{
    ClusterRegistry, ClusterSelection, JobCondition, JobKey, JobPhase, PolicyLookup, PolicyStore,
    ResourceApplier,
};
use crate::controller::config::OperatorConfig;
use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{Compliance, FleetUpgradeSpec, ManagedPolicyRef, PrecacheSpec};

/// Label naming the FleetUpgrade that created a hub object.
pub const UPGRADE_LABEL: &str = "fleet-operator.smoketurner.com/upgrade";
/// Label naming the namespace of that FleetUpgrade.
pub const UPGRADE_NAMESPACE_LABEL: &str = "fleet-operator.smoketurner.com/upgrade-namespace";
/// Policy annotation holding the minimum soak time in seconds.
pub const SOAK_ANNOTATION: &str = "fleet-operator.smoketurner.com/soak-seconds";

/// Present on replicated (per-cluster) copies of a policy.
const ROOT_POLICY_LABEL: &str = "policy.open-cluster-management.io/root-policy";

const VIEW_REFRESH_SECS: u64 = 30;

// ============================================================================
// API resources
// ============================================================================

fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

fn policy_resource() -> ApiResource {
    api_resource("policy.open-cluster-management.io", "v1", "Policy", "policies")
}

fn placement_binding_resource() -> ApiResource {
    api_resource(
        "policy.open-cluster-management.io",
        "v1",
        "PlacementBinding",
        "placementbindings",
    )
}

fn placement_rule_resource() -> ApiResource {
    api_resource(
        "apps.open-cluster-management.io",
        "v1",
        "PlacementRule",
        "placementrules",
    )
}

fn view_resource() -> ApiResource {
    api_resource(
        "view.open-cluster-management.io",
        "v1beta1",
        "ManagedClusterView",
        "managedclusterviews",
    )
}

fn action_resource() -> ApiResource {
    api_resource(
        "action.open-cluster-management.io",
        "v1beta1",
        "ManagedClusterAction",
        "managedclusteractions",
    )
}

fn managed_cluster_resource() -> ApiResource {
    api_resource(
        "cluster.open-cluster-management.io",
        "v1",
        "ManagedCluster",
        "managedclusters",
    )
}

// ============================================================================
// Policy parsing
// ============================================================================

/// Compliance of `cluster` according to a policy's `status.status[]`.
///
/// A policy without per-cluster status counts as non-compliant. A cluster
/// missing from a populated list is not matched by the policy.
pub fn parse_cluster_compliance(policy: &Value, cluster: &str) -> Compliance {
    let Some(entries) = policy.pointer("/status/status").and_then(Value::as_array) else {
        return Compliance::NonCompliant;
    };
    entries
        .iter()
        .find(|entry| entry.get("clustername").and_then(Value::as_str) == Some(cluster))
        .map_or(Compliance::NotMatched, |entry| {
            match entry.get("compliant").and_then(Value::as_str) {
                Some("Compliant") => Compliance::Compliant,
                // Pending and missing compliance both count as non-compliant
                _ => Compliance::NonCompliant,
            }
        })
}

/// Compliance of every cluster in `clusters` from one read of a policy.
///
/// A policy that no longer exists counts as non-compliant everywhere.
pub fn parse_clusters_compliance(
    policy: Option<&Value>,
    clusters: &[String],
) -> BTreeMap<String, Compliance> {
    clusters
        .iter()
        .map(|cluster| {
            let compliance = policy.map_or(Compliance::NonCompliant, |p| {
                parse_cluster_compliance(p, cluster)
            });
            (cluster.clone(), compliance)
        })
        .collect()
}

/// Parse the soak annotation value.
pub fn parse_soak_seconds(value: Option<&str>) -> Result<Option<Duration>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|_| {
            Error::Validation(format!(
                "soak annotation value {raw:?} is invalid, expected a non-negative integer"
            ))
        })
}

/// Check that a policy's templates have the shape the engine relies on.
pub fn inspect_policy(policy: &Value) -> std::result::Result<(), String> {
    let templates = policy
        .pointer("/spec/policy-templates")
        .and_then(Value::as_array)
        .ok_or_else(|| "policy is missing spec.policy-templates".to_string())?;

    for template in templates {
        let definition = template
            .get("objectDefinition")
            .ok_or_else(|| "policy template is missing its objectDefinition".to_string())?;
        if definition.get("metadata").is_none() {
            return Err("policy template objectDefinition is missing metadata".to_string());
        }
        let spec = definition
            .get("spec")
            .ok_or_else(|| "policy template objectDefinition is missing spec".to_string())?;
        let structured = spec.get("object-templates").is_some();
        let raw = spec.get("object-templates-raw").is_some();
        match (structured, raw) {
            (true, true) => {
                return Err(
                    "policy template defines both object-templates and object-templates-raw"
                        .to_string(),
                );
            }
            (false, false) => {
                return Err("policy template defines no object templates".to_string());
            }
            _ => {}
        }
    }
    Ok(())
}

/// Objects a policy enforces, skipping `mustnothave` templates.
///
/// Raw (string) object templates are not inspected.
pub fn policy_objects(policy: &Value) -> Vec<&Value> {
    policy
        .pointer("/spec/policy-templates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|t| t.pointer("/objectDefinition/spec/object-templates"))
        .filter_map(Value::as_array)
        .flatten()
        .filter(|t| t.get("complianceType").and_then(Value::as_str) != Some("mustnothave"))
        .filter_map(|t| t.get("objectDefinition"))
        .collect()
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Derive the pre-cache content from the objects the policies enforce.
///
/// - `ClusterVersion`: `spec.desiredUpdate.image` is the platform image
/// - `CatalogSource`: `spec.image` is an operator index
/// - `Subscription`: `spec.name:spec.channel` is an operator package
pub fn extract_precache_spec<'a, I>(policies: I) -> PrecacheSpec
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut spec = PrecacheSpec::default();
    for policy in policies {
        for object in policy_objects(policy) {
            let field = |path: &str| {
                object
                    .pointer(path)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            match object.get("kind").and_then(Value::as_str) {
                Some("ClusterVersion") => {
                    let image = field("/spec/desiredUpdate/image");
                    if !image.is_empty() {
                        spec.platform_image = image;
                    }
                }
                Some("CatalogSource") => push_unique(&mut spec.operators_indexes, field("/spec/image")),
                Some("Subscription") => {
                    let (name, channel) = (field("/spec/name"), field("/spec/channel"));
                    if !name.is_empty() {
                        push_unique(
                            &mut spec.operators_packages_and_channels,
                            format!("{name}:{channel}"),
                        );
                    }
                }
                _ => {}
            }
        }
    }
    spec
}

/// Group root policies by name, keeping every namespace each name appears in.
fn index_root_policies(policies: Vec<DynamicObject>) -> BTreeMap<String, Vec<DynamicObject>> {
    let mut index: BTreeMap<String, Vec<DynamicObject>> = BTreeMap::new();
    for policy in policies {
        if policy.labels().contains_key(ROOT_POLICY_LABEL) {
            continue;
        }
        index.entry(policy.name_any()).or_default().push(policy);
    }
    index
}

/// Sort the requested policy names into resolved, missing, invalid and ambiguous.
fn lookup_policies(
    requested: &[String],
    index: &BTreeMap<String, Vec<DynamicObject>>,
) -> PolicyLookup {
    let mut lookup = PolicyLookup::default();
    for name in requested {
        match index.get(name).map(Vec::as_slice) {
            None | Some([]) => lookup.missing.push(name.clone()),
            Some([policy]) => match inspect_policy(&policy.data) {
                Ok(()) => lookup.policies.push(ManagedPolicyRef::new(
                    name.clone(),
                    policy.namespace().unwrap_or_default(),
                )),
                Err(problem) => {
                    warn!(policy = %name, problem = %problem, "Policy is invalid");
                    lookup.invalid.push(name.clone());
                }
            },
            Some(many) => {
                let namespaces = many.iter().filter_map(|p| p.namespace()).collect();
                lookup.ambiguous.insert(name.clone(), namespaces);
            }
        }
    }
    lookup
}

// ============================================================================
// Policy store
// ============================================================================

/// Policy store reading policies from the hub.
#[derive(Clone)]
pub struct KubePolicyStore {
    client: Client,
}

impl KubePolicyStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_policy(&self, policy: &ManagedPolicyRef) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &policy.namespace, &policy_resource());
        Ok(api.get_opt(&policy.name).await?)
    }
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    async fn policy_list(&self, job: &JobKey, spec: &FleetUpgradeSpec) -> Result<PolicyLookup> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &policy_resource());
        let policies = api.list(&ListParams::default()).await?.items;
        let lookup = lookup_policies(&spec.managed_policies, &index_root_policies(policies));
        debug!(
            job = %job,
            resolved = lookup.policies.len(),
            missing = lookup.missing.len(),
            "Resolved managed policies"
        );
        Ok(lookup)
    }

    async fn compliance_of(&self, cluster: &str, policy: &ManagedPolicyRef) -> Result<Compliance> {
        match self.get_policy(policy).await? {
            Some(obj) => Ok(parse_cluster_compliance(&obj.data, cluster)),
            None => {
                warn!(policy = %policy.name, namespace = %policy.namespace, "Managed policy disappeared");
                Ok(Compliance::NonCompliant)
            }
        }
    }

    async fn cluster_compliance(
        &self,
        policy: &ManagedPolicyRef,
        clusters: &[String],
    ) -> Result<BTreeMap<String, Compliance>> {
        let obj = self.get_policy(policy).await?;
        if obj.is_none() {
            warn!(policy = %policy.name, namespace = %policy.namespace, "Managed policy disappeared");
        }
        Ok(parse_clusters_compliance(
            obj.as_ref().map(|o| &o.data),
            clusters,
        ))
    }

    async fn soak_duration(&self, policy: &ManagedPolicyRef) -> Result<Option<Duration>> {
        let Some(obj) = self.get_policy(policy).await? else {
            return Ok(None);
        };
        parse_soak_seconds(obj.annotations().get(SOAK_ANNOTATION).map(String::as_str))
    }

    async fn precache_spec(&self, policies: &[ManagedPolicyRef]) -> Result<PrecacheSpec> {
        let mut documents = Vec::with_capacity(policies.len());
        for policy in policies {
            if let Some(obj) = self.get_policy(policy).await? {
                documents.push(obj.data);
            }
        }
        Ok(extract_precache_spec(&documents))
    }
}

// ============================================================================
// Cluster registry
// ============================================================================

/// Render a label map as a `k=v,k2=v2` selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Registry backed by `ManagedCluster` objects.
#[derive(Clone)]
pub struct KubeClusterRegistry {
    client: Client,
}

impl KubeClusterRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterRegistry for KubeClusterRegistry {
    async fn resolve_clusters(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
    ) -> Result<ClusterSelection> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &managed_cluster_resource());
        let mut selection = ClusterSelection::default();

        for name in &spec.clusters {
            if selection.clusters.contains(name) || selection.missing.contains(name) {
                continue;
            }
            if api.get_opt(name).await?.is_some() {
                selection.clusters.push(name.clone());
            } else {
                selection.missing.push(name.clone());
            }
        }

        if !spec.cluster_label_selector.is_empty() {
            let params = ListParams::default().labels(&label_selector(&spec.cluster_label_selector));
            let mut selected: Vec<String> = api
                .list(&params)
                .await?
                .items
                .iter()
                .map(ResourceExt::name_any)
                .collect();
            selected.sort();
            for name in selected {
                if !selection.clusters.contains(&name) {
                    selection.clusters.push(name);
                }
            }
        }

        debug!(
            job = %job,
            clusters = selection.clusters.len(),
            missing = selection.missing.len(),
            "Resolved target clusters"
        );
        Ok(selection)
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// Names of the objects a phase creates on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseNames {
    pub namespace: &'static str,
    pub job: &'static str,
    pub service_account: &'static str,
    /// Active deadline of the job, in seconds.
    pub deadline_secs: u64,
}

pub fn phase_names(phase: JobPhase) -> PhaseNames {
    match phase {
        JobPhase::Backup => PhaseNames {
            namespace: "fleet-upgrade-backup",
            job: "backup-agent",
            service_account: "backup-agent",
            deadline_secs: 480,
        },
        JobPhase::Precache => PhaseNames {
            namespace: "fleet-upgrade-precache",
            job: "pre-cache",
            service_account: "pre-cache-agent",
            deadline_secs: 3000,
        },
    }
}

/// Hub-side view names. The first entry is the job view.
fn view_name(phase: JobPhase, what: &str) -> String {
    format!("view-{phase}-{what}")
}

fn action_name(phase: JobPhase, what: &str) -> String {
    format!("{phase}-{what}")
}

const DEPENDENCY_VIEWS: [&str; 2] = ["namespace", "service-acct"];
const ALL_VIEWS: [&str; 3] = ["job", "namespace", "service-acct"];
const ALL_ACTIONS: [&str; 6] = [
    "ns-create",
    "sa-create",
    "crb-create",
    "spec-cm-create",
    "job-create",
    "ns-delete",
];

/// Object a view mirrors from the cluster.
#[derive(Debug, Clone, Copy)]
struct ViewTarget<'a> {
    group: &'a str,
    kind: &'a str,
    name: &'a str,
    namespace: Option<&'a str>,
}

fn view_manifest(name: &str, cluster: &str, target: ViewTarget<'_>) -> Value {
    let mut scope = json!({
        "apiGroup": target.group,
        "version": "v1",
        "kind": target.kind,
        "name": target.name,
        "updateIntervalSeconds": VIEW_REFRESH_SECS,
    });
    if let Some(ns) = target.namespace {
        scope["namespace"] = json!(ns);
    }
    json!({
        "apiVersion": "view.open-cluster-management.io/v1beta1",
        "kind": "ManagedClusterView",
        "metadata": { "name": name, "namespace": cluster },
        "spec": { "scope": scope }
    })
}

fn create_action_manifest(name: &str, cluster: &str, namespace: Option<&str>, template: Value) -> Value {
    let mut kube = json!({ "resource": template["kind"].as_str().unwrap_or_default().to_lowercase(), "template": template });
    if let Some(ns) = namespace {
        kube["namespace"] = json!(ns);
    }
    json!({
        "apiVersion": "action.open-cluster-management.io/v1beta1",
        "kind": "ManagedClusterAction",
        "metadata": { "name": name, "namespace": cluster },
        "spec": { "actionType": "Create", "kube": kube }
    })
}

fn delete_namespace_action_manifest(name: &str, cluster: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "action.open-cluster-management.io/v1beta1",
        "kind": "ManagedClusterAction",
        "metadata": { "name": name, "namespace": cluster },
        "spec": {
            "actionType": "Delete",
            "kube": { "resource": "namespace", "name": namespace }
        }
    })
}

/// The job a phase runs on a managed cluster.
pub fn job_manifest(phase: JobPhase, image: &str) -> Value {
    let names = phase_names(phase);
    let mut container = json!({
        "name": names.job,
        "image": image,
        "args": [phase.to_string()],
        "securityContext": { "privileged": true, "runAsUser": 0 },
        "volumeMounts": [{ "name": "host", "mountPath": "/host" }]
    });
    let mut volumes = vec![json!({ "name": "host", "hostPath": { "path": "/", "type": "Directory" } })];
    if phase == JobPhase::Precache {
        if let Some(mounts) = container["volumeMounts"].as_array_mut() {
            mounts.push(json!({ "name": "pre-cache-spec", "mountPath": "/etc/config", "readOnly": true }));
        }
        volumes.push(json!({ "name": "pre-cache-spec", "configMap": { "name": "pre-cache-spec" } }));
    }
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": names.job, "namespace": names.namespace },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": names.deadline_secs,
            "template": {
                "spec": {
                    "serviceAccountName": names.service_account,
                    "restartPolicy": "Never",
                    "hostNetwork": true,
                    "containers": [container],
                    "volumes": volumes
                }
            }
        }
    })
}

/// ConfigMap carrying the pre-cache content list to the job.
pub fn precache_configmap(spec: &PrecacheSpec) -> Value {
    let names = phase_names(JobPhase::Precache);
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "pre-cache-spec", "namespace": names.namespace },
        "data": {
            "platform.image": spec.platform_image,
            "operators.indexes": spec.operators_indexes.join("\n"),
            "operators.packagesAndChannels": spec.operators_packages_and_channels.join("\n"),
            "additionalImages": spec.additional_images.join("\n"),
            "excludePrecachePatterns": spec.exclude_precache_patterns.join("\n"),
            "spaceRequired": spec.space_required.clone().unwrap_or_default(),
        }
    })
}

/// Placement objects for one policy and one batch share this name.
pub fn binding_name(job: &JobKey, policy: &ManagedPolicyRef, batch_index: usize) -> String {
    format!("{}-{}-batch-{}", job.name, policy.name, batch_index)
}

fn ownership_labels(job: &JobKey) -> Value {
    json!({ UPGRADE_LABEL: job.name, UPGRADE_NAMESPACE_LABEL: job.namespace })
}

pub fn placement_rule_manifest(
    job: &JobKey,
    policy: &ManagedPolicyRef,
    batch_index: usize,
    clusters: &[String],
) -> Value {
    json!({
        "apiVersion": "apps.open-cluster-management.io/v1",
        "kind": "PlacementRule",
        "metadata": {
            "name": binding_name(job, policy, batch_index),
            "namespace": policy.namespace,
            "labels": ownership_labels(job),
        },
        "spec": {
            "clusterSelector": {
                "matchExpressions": [{ "key": "name", "operator": "In", "values": clusters }]
            }
        }
    })
}

pub fn placement_binding_manifest(job: &JobKey, policy: &ManagedPolicyRef, batch_index: usize) -> Value {
    let name = binding_name(job, policy, batch_index);
    json!({
        "apiVersion": "policy.open-cluster-management.io/v1",
        "kind": "PlacementBinding",
        "metadata": {
            "name": name,
            "namespace": policy.namespace,
            "labels": ownership_labels(job),
        },
        "placementRef": {
            "name": name,
            "kind": "PlacementRule",
            "apiGroup": "apps.open-cluster-management.io"
        },
        "subjects": [{
            "name": policy.name,
            "kind": "Policy",
            "apiGroup": "policy.open-cluster-management.io"
        }]
    })
}

// ============================================================================
// View parsing
// ============================================================================

/// What a view reports about the object it mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// The view has not been processed yet.
    Pending,
    Found,
    NotFound,
}

/// Read the `Processing` condition of a view.
pub fn view_state(view: &Value) -> Result<ViewState> {
    let Some(processing) = view
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some("Processing"))
        })
    else {
        return Ok(ViewState::Pending);
    };
    if processing.get("status").and_then(Value::as_str) == Some("True") {
        return Ok(ViewState::Found);
    }
    let message = processing
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if message.ends_with("not found") {
        Ok(ViewState::NotFound)
    } else {
        Err(Error::Transient(format!("view processing failed: {message}")))
    }
}

/// Classify the job status mirrored in `status.result.status`.
///
/// A job that reports nothing yet is treated as active.
pub fn parse_job_condition(view: &Value) -> Result<JobCondition> {
    let Some(status) = view.pointer("/status/result/status") else {
        return Ok(JobCondition::Active);
    };
    let count = |key: &str| status.get(key).and_then(Value::as_i64).unwrap_or(0);
    if count("active") > 0 {
        return Ok(JobCondition::Active);
    }
    if count("succeeded") > 0 {
        return Ok(JobCondition::Succeeded);
    }
    let failed = status
        .get("conditions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|c| {
            c.get("type").and_then(Value::as_str) == Some("Failed")
                && c.get("status").and_then(Value::as_str) == Some("True")
        });
    match failed.and_then(|c| c.get("reason")).and_then(Value::as_str) {
        Some("DeadlineExceeded") => Ok(JobCondition::DeadlineExceeded),
        Some("BackoffLimitExceeded") => Ok(JobCondition::BackoffExceeded),
        Some(other) => Err(Error::Transient(format!("job failed with unexpected reason {other}"))),
        None if status.as_object().is_some_and(|o| o.is_empty()) => Ok(JobCondition::Active),
        None => Err(Error::Transient(format!("unrecognized job status: {status}"))),
    }
}

// ============================================================================
// Resource applier
// ============================================================================

/// Applier creating placements on the hub and jobs through cluster actions.
#[derive(Clone)]
pub struct KubeResourceApplier {
    client: Client,
    config: Arc<OperatorConfig>,
}

impl KubeResourceApplier {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self { client, config }
    }

    async fn apply(&self, ar: &ApiResource, namespace: &str, name: &str, body: &Value) -> Result<()> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(body),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_view(&self, cluster: &str, name: &str) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), cluster, &view_resource());
        Ok(api.get_opt(name).await?)
    }

    async fn apply_view(&self, cluster: &str, name: &str, target: ViewTarget<'_>) -> Result<()> {
        self.apply(&view_resource(), cluster, name, &view_manifest(name, cluster, target))
            .await
    }

    async fn apply_create_action(
        &self,
        cluster: &str,
        name: &str,
        namespace: Option<&str>,
        template: Value,
    ) -> Result<()> {
        let body = create_action_manifest(name, cluster, namespace, template);
        self.apply(&action_resource(), cluster, name, &body).await
    }

    async fn ensure_namespace_view(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        let names = phase_names(phase);
        self.apply_view(
            cluster,
            &view_name(phase, "namespace"),
            ViewTarget {
                group: "",
                kind: "Namespace",
                name: names.namespace,
                namespace: None,
            },
        )
        .await
    }

    /// Every dependency view reports its object as present.
    async fn dependencies_ready(&self, cluster: &str, phase: JobPhase) -> Result<bool> {
        for what in DEPENDENCY_VIEWS {
            let Some(view) = self.get_view(cluster, &view_name(phase, what)).await? else {
                return Ok(false);
            };
            if view_state(&view.data)? != ViewState::Found {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ResourceApplier for KubeResourceApplier {
    async fn ensure_binding(
        &self,
        job: &JobKey,
        batch_index: usize,
        clusters: &[String],
        policy: &ManagedPolicyRef,
    ) -> Result<()> {
        let name = binding_name(job, policy, batch_index);
        self.apply(
            &placement_rule_resource(),
            &policy.namespace,
            &name,
            &placement_rule_manifest(job, policy, batch_index, clusters),
        )
        .await?;
        self.apply(
            &placement_binding_resource(),
            &policy.namespace,
            &name,
            &placement_binding_manifest(job, policy, batch_index),
        )
        .await?;
        debug!(job = %job, policy = %policy.name, batch = batch_index, "Placement ensured");
        Ok(())
    }

    async fn delete_bindings(&self, job: &JobKey) -> Result<()> {
        let selector = format!(
            "{UPGRADE_LABEL}={},{UPGRADE_NAMESPACE_LABEL}={}",
            job.name, job.namespace
        );
        let params = ListParams::default().labels(&selector);
        for ar in [placement_binding_resource(), placement_rule_resource()] {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            for obj in api.list(&params).await?.items {
                let namespace = obj.namespace().unwrap_or_default();
                self.delete(&ar, &namespace, &obj.name_any()).await?;
            }
        }
        info!(job = %job, "Deleted placement objects");
        Ok(())
    }

    async fn ensure_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        let names = phase_names(phase);
        let image = match phase {
            JobPhase::Backup => &self.config.backup_image,
            JobPhase::Precache => &self.config.precache_image,
        };
        self.apply_create_action(
            cluster,
            &action_name(phase, "job-create"),
            Some(names.namespace),
            job_manifest(phase, image),
        )
        .await?;
        self.ensure_job_view(cluster, phase).await
    }

    async fn ensure_dependencies(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        let names = phase_names(phase);
        self.apply_create_action(
            cluster,
            &action_name(phase, "ns-create"),
            None,
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": names.namespace }
            }),
        )
        .await?;
        self.apply_create_action(
            cluster,
            &action_name(phase, "sa-create"),
            Some(names.namespace),
            json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": { "name": names.service_account, "namespace": names.namespace }
            }),
        )
        .await?;
        self.apply_create_action(
            cluster,
            &action_name(phase, "crb-create"),
            None,
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "ClusterRoleBinding",
                "metadata": { "name": names.service_account },
                "roleRef": {
                    "apiGroup": "rbac.authorization.k8s.io",
                    "kind": "ClusterRole",
                    "name": "cluster-admin"
                },
                "subjects": [{
                    "kind": "ServiceAccount",
                    "name": names.service_account,
                    "namespace": names.namespace
                }]
            }),
        )
        .await?;

        self.ensure_namespace_view(cluster, phase).await?;
        self.apply_view(
            cluster,
            &view_name(phase, "service-acct"),
            ViewTarget {
                group: "",
                kind: "ServiceAccount",
                name: names.service_account,
                namespace: Some(names.namespace),
            },
        )
        .await
    }

    async fn stage_precache_spec(&self, cluster: &str, spec: &PrecacheSpec) -> Result<()> {
        let names = phase_names(JobPhase::Precache);
        self.apply_create_action(
            cluster,
            &action_name(JobPhase::Precache, "spec-cm-create"),
            Some(names.namespace),
            precache_configmap(spec),
        )
        .await
    }

    async fn ensure_job_view(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        let names = phase_names(phase);
        self.apply_view(
            cluster,
            &view_name(phase, "job"),
            ViewTarget {
                group: "batch",
                kind: "Job",
                name: names.job,
                namespace: Some(names.namespace),
            },
        )
        .await
    }

    async fn observe_job_condition(&self, cluster: &str, phase: JobPhase) -> Result<JobCondition> {
        let Some(view) = self.get_view(cluster, &view_name(phase, "job")).await? else {
            return Ok(if self.dependencies_ready(cluster, phase).await? {
                JobCondition::ViewMissing
            } else {
                JobCondition::DependenciesMissing
            });
        };
        match view_state(&view.data)? {
            // Not synced yet: re-applying the view is harmless
            ViewState::Pending => Ok(JobCondition::ViewMissing),
            ViewState::NotFound => Ok(if self.dependencies_ready(cluster, phase).await? {
                JobCondition::Missing
            } else {
                JobCondition::DependenciesMissing
            }),
            ViewState::Found => parse_job_condition(&view.data),
        }
    }

    async fn job_namespace_present(&self, cluster: &str, phase: JobPhase) -> Result<bool> {
        let Some(view) = self.get_view(cluster, &view_name(phase, "namespace")).await? else {
            return Ok(false);
        };
        Ok(match view_state(&view.data)? {
            ViewState::Found | ViewState::Pending => true,
            ViewState::NotFound => false,
        })
    }

    async fn delete_job_namespace(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        let name = action_name(phase, "ns-delete");
        let body = delete_namespace_action_manifest(&name, cluster, phase_names(phase).namespace);
        self.apply(&action_resource(), cluster, &name, &body).await?;
        // Keep watching the namespace until it is gone
        self.ensure_namespace_view(cluster, phase).await
    }

    async fn delete_dependency_views(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        for what in DEPENDENCY_VIEWS {
            self.delete(&view_resource(), cluster, &view_name(phase, what))
                .await?;
        }
        Ok(())
    }

    async fn cleanup_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        for what in ALL_VIEWS {
            self.delete(&view_resource(), cluster, &view_name(phase, what))
                .await?;
        }
        for what in ALL_ACTIONS {
            self.delete(&action_resource(), cluster, &action_name(phase, what))
                .await?;
        }
        debug!(cluster = %cluster, phase = %phase, "Cleaned up job resources");
        Ok(())
    }
}
