//! Image builder stack: role, instance profile, security group, custom
//! components, the recipe, the infrastructure config and the scheduled
//! image pipeline.

use serde_json::{json, Value};

use super::template::{import_value, reference, ResourceSpec, Template};
use crate::component::Component;
use crate::config::AccountScope;
use crate::image_pipeline::{Schedule, TriggerCondition};
use crate::infra::InfrastructureConfig;
use crate::recipe::Recipe;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuilderStack {
    pub name: String,
    /// Stack exporting the VPC and subnet ids.
    pub network_stack: String,
    pub depends_on: Vec<String>,
    /// Recipe components, in install order.
    pub components: Vec<Component>,
    pub recipe: Recipe,
    pub infrastructure: InfrastructureConfig,
    pub pipeline_name: String,
    pub schedule: Option<Schedule>,
    pub condition: TriggerCondition,
}

/// Logical id for a component resource: `Component` + alphanumerics of the
/// name in PascalCase.
fn component_logical_id(name: &str) -> String {
    let mut id = String::from("Component");
    for part in name.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            id.push(first.to_ascii_uppercase());
            id.extend(chars);
        }
    }
    id
}

/// A literal `subnet-...` id, or the export name of a stack output.
fn subnet_value(subnet_id: &str) -> Value {
    if subnet_id.starts_with("subnet-") {
        json!(subnet_id)
    } else {
        import_value(subnet_id)
    }
}

/// Start condition the build service uses for a trigger condition.
fn start_condition(condition: TriggerCondition) -> &'static str {
    match condition {
        TriggerCondition::ScheduleMatchAndDependencyUpdated => {
            "EXPRESSION_MATCH_AND_DEPENDENCY_UPDATES_AVAILABLE"
        }
        TriggerCondition::Always | TriggerCondition::ScheduleMatchOnly => "EXPRESSION_MATCH_ONLY",
    }
}

impl ImageBuilderStack {
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = vec![self.network_stack.clone()];
        for extra in &self.depends_on {
            if !deps.contains(extra) {
                deps.push(extra.clone());
            }
        }
        deps
    }

    pub fn template(&self, scope: &AccountScope) -> crate::Result<Template> {
        let infra = &self.infrastructure;
        let policy = &infra.security_policy;

        let mut template = Template::new(format!(
            "{} image pipeline {} building {} {}",
            self.name, self.pipeline_name, self.recipe.name, self.recipe.version
        ))
        .with_resource(
            "ImageBuilderRole",
            ResourceSpec::new(
                "AWS::IAM::Role",
                json!({
                    "RoleName": policy.role_name,
                    "AssumeRolePolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Principal": { "Service": "ec2.amazonaws.com" },
                            "Action": "sts:AssumeRole",
                        }],
                    },
                    "ManagedPolicyArns": policy.managed_policies,
                }),
            ),
        )
        .with_resource(
            "InstanceProfile",
            ResourceSpec::new(
                "AWS::IAM::InstanceProfile",
                json!({
                    "InstanceProfileName": infra.profile,
                    "Roles": [reference("ImageBuilderRole")],
                }),
            ),
        )
        .with_resource(
            "BuildSecurityGroup",
            ResourceSpec::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{} build instances", self.pipeline_name),
                    "VpcId": import_value(&super::network::network_export(&self.network_stack, "VpcId")),
                }),
            ),
        );

        let mut recipe_components = Vec::with_capacity(self.components.len());
        for component in &self.components {
            if component.is_managed() {
                recipe_components.push(json!({ "ComponentArn": component.arn(scope) }));
                continue;
            }
            let id = component_logical_id(&component.name);
            template = template.with_resource(
                &id,
                ResourceSpec::new(
                    "AWS::ImageBuilder::Component",
                    json!({
                        "Name": component.name,
                        "Platform": component.platform.to_string(),
                        "Version": component.version.to_string(),
                        "Data": component.payload.to_yaml()?,
                    }),
                ),
            );
            recipe_components.push(json!({ "ComponentArn": reference(&id) }));
        }

        let mut security_groups = vec![reference("BuildSecurityGroup")];
        security_groups.extend(infra.placement.security_group_ids.iter().map(|id| json!(id)));

        let mut pipeline = json!({
            "Name": self.pipeline_name,
            "ImageRecipeArn": reference("ImageRecipe"),
            "InfrastructureConfigurationArn": reference("InfrastructureConfiguration"),
            "Status": "ENABLED",
        });
        if let Some(schedule) = &self.schedule {
            pipeline["Schedule"] = json!({
                "ScheduleExpression": schedule.expression(),
                "PipelineExecutionStartCondition": start_condition(self.condition),
            });
        }

        Ok(template
            .with_resource(
                "ImageRecipe",
                ResourceSpec::new(
                    "AWS::ImageBuilder::ImageRecipe",
                    json!({
                        "Name": self.recipe.name,
                        "Version": self.recipe.version.to_string(),
                        "ParentImage": self.recipe.base_image.arn(scope),
                        "Components": recipe_components,
                    }),
                ),
            )
            .with_resource(
                "InfrastructureConfiguration",
                ResourceSpec::new(
                    "AWS::ImageBuilder::InfrastructureConfiguration",
                    json!({
                        "Name": infra.name,
                        "InstanceTypes": infra.compute_class,
                        "InstanceProfileName": reference("InstanceProfile"),
                        "SubnetId": subnet_value(&infra.placement.subnet_id),
                        "SecurityGroupIds": security_groups,
                    }),
                )
                .depends_on("InstanceProfile"),
            )
            .with_resource(
                "ImagePipeline",
                ResourceSpec::new("AWS::ImageBuilder::ImagePipeline", pipeline),
            )
            .with_output("RecipeArn", json!(self.recipe.arn(scope)), None)
            .with_output("ImagePipelineArn", reference("ImagePipeline"), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentRegistry, Platform};
    use crate::infra::{Placement, SecurityPolicy};
    use crate::recipe::{BaseImageRef, ComponentRef};

    const NVIDIA: &str = r#"
name: InstallNvidia
schemaVersion: 1.0
phases:
  - name: build
    steps:
      - name: Install
        action: ExecutePowerShell
        inputs:
          commands: ["echo nvidia"]
"#;

    fn stack(schedule: Option<Schedule>, condition: TriggerCondition) -> ImageBuilderStack {
        let mut registry = ComponentRegistry::new();
        let choco = registry
            .register_managed("chocolatey", Platform::Windows, "1.0.0", "chocolatey")
            .unwrap();
        let nvidia = registry
            .register_document("nvidia", Platform::Windows, "0.0.5", NVIDIA)
            .unwrap();
        ImageBuilderStack {
            name: "UEPSBuilderStack".to_string(),
            network_stack: "UEPSNetworkStack".to_string(),
            depends_on: vec![],
            recipe: Recipe {
                name: "UEPSWindowsImageRecipe".to_string(),
                version: semver::Version::new(1, 0, 5),
                components: vec![ComponentRef::from(&choco), ComponentRef::from(&nvidia)],
                base_image: BaseImageRef::new("windows-server-2019-full-base", "x.x.x").unwrap(),
            },
            components: vec![choco, nvidia],
            infrastructure: InfrastructureConfig::define(
                "UEPSWindowsImageInfrastructureConfig",
                vec!["g4dn.xlarge".to_string()],
                Placement {
                    subnet_id: "UEPSNetworkStack-SubnetId".to_string(),
                    security_group_ids: vec![],
                },
                "UEPSWindowsImageInstanceProfile",
                SecurityPolicy {
                    role_name: "UEPSWindowsImageBuilderRole".to_string(),
                    managed_policies: vec![],
                },
            )
            .unwrap(),
            pipeline_name: "UEPSWindowsImagePipeline".to_string(),
            schedule,
            condition,
        }
    }

    #[test]
    fn test_recipe_keeps_component_order_and_managed_arns() {
        let scope = AccountScope::new("us-east-1", "123456789012");
        let t = stack(None, TriggerCondition::Always).template(&scope).unwrap();
        let recipe = &t.resources["ImageRecipe"].properties;
        let components = recipe["Components"].as_array().unwrap();
        assert_eq!(
            components[0]["ComponentArn"],
            "arn:aws:imagebuilder:us-east-1:aws:component/chocolatey/1.0.0"
        );
        assert_eq!(components[1]["ComponentArn"], json!({ "Ref": "ComponentNvidia" }));
        assert_eq!(
            recipe["ParentImage"],
            "arn:aws:imagebuilder:us-east-1:aws:image/windows-server-2019-full-base/x.x.x"
        );
        // Managed components are not declared as resources.
        assert_eq!(t.resources_of_type("AWS::ImageBuilder::Component").count(), 1);
        assert!(t.resources["ImagePipeline"].properties.get("Schedule").is_none());
        assert_eq!(
            t.imports(),
            vec!["UEPSNetworkStack-SubnetId", "UEPSNetworkStack-VpcId"]
        );
    }

    #[test]
    fn test_schedule_start_condition() {
        let scope = AccountScope::new("us-east-1", "123456789012");
        let s = Schedule::parse("cron(0 9 ? * MON *)").unwrap();
        let t = stack(Some(s), TriggerCondition::ScheduleMatchAndDependencyUpdated)
            .template(&scope)
            .unwrap();
        let schedule = &t.resources["ImagePipeline"].properties["Schedule"];
        assert_eq!(schedule["ScheduleExpression"], "cron(0 9 ? * MON *)");
        assert_eq!(
            schedule["PipelineExecutionStartCondition"],
            "EXPRESSION_MATCH_AND_DEPENDENCY_UPDATES_AVAILABLE"
        );
    }

    #[test]
    fn test_logical_ids() {
        assert_eq!(component_logical_id("firewall-rules"), "ComponentFirewallRules");
        assert_eq!(component_logical_id("nice-dcv"), "ComponentNiceDcv");
    }
}
