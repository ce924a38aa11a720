//! Release pipeline stack: artifact bucket, build project, the pipeline
//! itself and its source webhook.
//!
//! The pipeline resource carries the serialized [`PipelineDefinition`] under
//! `Definition`, so deploying this stack is how a definition change reaches
//! later runs.

use serde_json::{json, Value};

use super::template::{get_att, reference, ResourceSpec, Template};
use crate::domain::error::{Result, UepsError};
use crate::domain::pipeline::{template_artifact_name, ActionDef, ActionKind, PipelineDefinition};

pub const PIPELINE_RESOURCE_TYPE: &str = "AWS::CodePipeline::Pipeline";
pub const DEFINITION_PROPERTY: &str = "Definition";

/// Where the source action pulls from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRepository {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePipelineStack {
    pub name: String,
    pub definition: PipelineDefinition,
    /// Existing bucket to import instead of creating one.
    pub artifact_bucket: Option<String>,
    pub source: SourceRepository,
    pub depends_on: Vec<String>,
}

fn action_type(kind: &ActionKind) -> Value {
    let (category, provider) = match kind {
        ActionKind::Source => ("Source", "GitHub"),
        ActionKind::Build => ("Build", "CodeBuild"),
        ActionKind::Deploy { .. } => ("Deploy", "CloudFormation"),
    };
    json!({ "Category": category, "Owner": "AWS", "Provider": provider, "Version": "1" })
}

fn artifact_list(names: &[String]) -> Value {
    Value::Array(names.iter().map(|n| json!({ "Name": n })).collect())
}

impl ReleasePipelineStack {
    fn render_action(&self, action: &ActionDef) -> Value {
        let configuration = match &action.kind {
            ActionKind::Source => json!({
                "Owner": self.source.owner,
                "Repo": self.source.repo,
                "Branch": self.source.branch,
                "PollForSourceChanges": false,
            }),
            ActionKind::Build => json!({ "ProjectName": reference("BuildProject") }),
            ActionKind::Deploy { stack } => {
                let artifact = template_artifact_name(stack);
                json!({
                    "ActionMode": "CREATE_UPDATE",
                    "StackName": stack,
                    "TemplatePath": format!("{artifact}::{artifact}"),
                    "Capabilities": "CAPABILITY_NAMED_IAM",
                    "RoleArn": get_att("PipelineRole", "Arn"),
                })
            }
        };
        json!({
            "Name": action.name,
            "ActionTypeId": action_type(&action.kind),
            "RunOrder": action.run_order,
            "InputArtifacts": artifact_list(&action.inputs),
            "OutputArtifacts": artifact_list(&action.outputs),
            "Configuration": configuration,
        })
    }

    pub fn template(&self) -> Result<Template> {
        let definition = &self.definition;
        definition.validate()?;

        let stages: Vec<Value> = definition
            .stages
            .iter()
            .map(|stage| {
                json!({
                    "Name": stage.name,
                    "Actions": stage.actions.iter().map(|a| self.render_action(a)).collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut template = Template::new(format!(
            "{} release pipeline {}",
            self.name, definition.name
        ));

        let bucket = match &self.artifact_bucket {
            Some(existing) => json!(existing),
            None => {
                template = template.with_resource(
                    "ArtifactBucket",
                    ResourceSpec::new(
                        "AWS::S3::Bucket",
                        json!({
                            "VersioningConfiguration": { "Status": "Enabled" },
                            "BucketEncryption": {
                                "ServerSideEncryptionConfiguration": [{
                                    "ServerSideEncryptionByDefault": { "SSEAlgorithm": "aws:kms" },
                                }],
                            },
                            "PublicAccessBlockConfiguration": {
                                "BlockPublicAcls": true,
                                "BlockPublicPolicy": true,
                                "IgnorePublicAcls": true,
                                "RestrictPublicBuckets": true,
                            },
                        }),
                    ),
                );
                reference("ArtifactBucket")
            }
        };

        let source_action = definition
            .stages
            .iter()
            .flat_map(|s| &s.actions)
            .find(|a| a.kind == ActionKind::Source)
            .map(|a| a.name.clone())
            .ok_or_else(|| {
                UepsError::InvalidPipeline(format!("pipeline {} has no source action", definition.name))
            })?;

        let build_outputs: Vec<&String> = definition
            .stages
            .iter()
            .flat_map(|s| &s.actions)
            .filter(|a| a.kind == ActionKind::Build)
            .flat_map(|a| &a.outputs)
            .collect();

        Ok(template
            .with_resource(
                "PipelineRole",
                ResourceSpec::new(
                    "AWS::IAM::Role",
                    json!({
                        "AssumeRolePolicyDocument": {
                            "Version": "2012-10-17",
                            "Statement": [{
                                "Effect": "Allow",
                                "Principal": { "Service": ["codepipeline.amazonaws.com", "cloudformation.amazonaws.com", "codebuild.amazonaws.com"] },
                                "Action": "sts:AssumeRole",
                            }],
                        },
                        "ManagedPolicyArns": ["arn:aws:iam::aws:policy/AdministratorAccess"],
                    }),
                ),
            )
            .with_resource(
                "BuildProject",
                ResourceSpec::new(
                    "AWS::CodeBuild::Project",
                    json!({
                        "Name": format!("{}-synth", definition.name),
                        "ServiceRole": get_att("PipelineRole", "Arn"),
                        "Environment": {
                            "ComputeType": "BUILD_GENERAL1_SMALL",
                            "Image": "aws/codebuild/standard:7.0",
                            "Type": "LINUX_CONTAINER",
                        },
                        "Source": {
                            "Type": "CODEPIPELINE",
                            "BuildSpec": {
                                "version": "0.2",
                                "phases": {
                                    "build": { "commands": ["ueps synth --config ueps.toml --out cdk.out"] },
                                },
                                "artifacts": { "base-directory": "cdk.out", "files": build_outputs },
                            },
                        },
                        "Artifacts": { "Type": "CODEPIPELINE" },
                    }),
                ),
            )
            .with_resource(
                "Pipeline",
                ResourceSpec::new(
                    PIPELINE_RESOURCE_TYPE,
                    json!({
                        "Name": definition.name,
                        "RoleArn": get_att("PipelineRole", "Arn"),
                        "RestartExecutionOnUpdate": definition.restart_on_update,
                        "ArtifactStore": { "Type": "S3", "Location": bucket },
                        "Stages": stages,
                        DEFINITION_PROPERTY: serde_json::to_value(definition)?,
                    }),
                ),
            )
            .with_resource(
                "SourceWebhook",
                ResourceSpec::new(
                    "AWS::CodePipeline::Webhook",
                    json!({
                        "Authentication": "GITHUB_HMAC",
                        "Filters": [{
                            "JsonPath": "$.ref",
                            "MatchEquals": format!("refs/heads/{}", self.source.branch),
                        }],
                        "TargetPipeline": reference("Pipeline"),
                        "TargetAction": source_action,
                        "TargetPipelineVersion": 1,
                        "RegisterWithThirdParty": true,
                    }),
                ),
            )
            .with_output("PipelineName", reference("Pipeline"), None))
    }
}

/// Read the pipeline definition carried by a release pipeline template, if
/// the template has one.
pub fn definition_from_template(template: &Template) -> Result<Option<PipelineDefinition>> {
    let Some((_, resource)) = template.resources_of_type(PIPELINE_RESOURCE_TYPE).next() else {
        return Ok(None);
    };
    match resource.properties.get(DEFINITION_PROPERTY) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}
