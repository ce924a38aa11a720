//! Network stack: a VPC with public subnets, exporting the ids the image
//! builder stack places its build instances in.

use serde_json::json;

use super::template::{get_att, reference, ResourceSpec, Template};

/// Export name for an output of the network stack.
pub fn network_export(stack: &str, key: &str) -> String {
    format!("{stack}-{key}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStack {
    pub name: String,
    pub cidr: String,
    pub max_azs: u32,
    pub depends_on: Vec<String>,
}

impl NetworkStack {
    pub fn subnet_export(&self) -> String {
        network_export(&self.name, "SubnetId")
    }

    pub fn vpc_export(&self) -> String {
        network_export(&self.name, "VpcId")
    }

    pub fn template(&self) -> Template {
        let azs = self.max_azs.max(1);
        let mut template = Template::new(format!("{} VPC ({})", self.name, self.cidr))
            .with_resource(
                "Vpc",
                ResourceSpec::new(
                    "AWS::EC2::VPC",
                    json!({
                        "CidrBlock": self.cidr,
                        "EnableDnsHostnames": true,
                        "EnableDnsSupport": true,
                    }),
                ),
            )
            .with_resource(
                "InternetGateway",
                ResourceSpec::new("AWS::EC2::InternetGateway", json!({})),
            )
            .with_resource(
                "GatewayAttachment",
                ResourceSpec::new(
                    "AWS::EC2::VPCGatewayAttachment",
                    json!({
                        "VpcId": reference("Vpc"),
                        "InternetGatewayId": reference("InternetGateway"),
                    }),
                ),
            )
            .with_resource(
                "PublicRouteTable",
                ResourceSpec::new(
                    "AWS::EC2::RouteTable",
                    json!({ "VpcId": reference("Vpc") }),
                ),
            )
            .with_resource(
                "PublicDefaultRoute",
                ResourceSpec::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": reference("PublicRouteTable"),
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "GatewayId": reference("InternetGateway"),
                    }),
                )
                .depends_on("GatewayAttachment"),
            );

        for az in 0..azs {
            let subnet = format!("PublicSubnet{}", az + 1);
            template = template
                .with_resource(
                    &subnet,
                    ResourceSpec::new(
                        "AWS::EC2::Subnet",
                        json!({
                            "VpcId": reference("Vpc"),
                            "AvailabilityZone": { "Fn::Select": [az, { "Fn::GetAZs": "" }] },
                            "CidrBlock": { "Fn::Select": [az, { "Fn::Cidr": [self.cidr, azs, "8"] }] },
                            "MapPublicIpOnLaunch": true,
                        }),
                    ),
                )
                .with_resource(
                    &format!("{subnet}RouteTableAssociation"),
                    ResourceSpec::new(
                        "AWS::EC2::SubnetRouteTableAssociation",
                        json!({
                            "SubnetId": reference(&subnet),
                            "RouteTableId": reference("PublicRouteTable"),
                        }),
                    ),
                );
        }

        template
            .with_output("VpcId", reference("Vpc"), Some(&self.vpc_export()))
            .with_output(
                "SubnetId",
                reference("PublicSubnet1"),
                Some(&self.subnet_export()),
            )
            .with_output("VpcCidr", get_att("Vpc", "CidrBlock"), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_subnet_per_az_and_exports() {
        let stack = NetworkStack {
            name: "UEPSNetworkStack".to_string(),
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            depends_on: vec![],
        };
        let t = stack.template();
        assert_eq!(t.resources_of_type("AWS::EC2::Subnet").count(), 2);
        let mut exports = t.exports();
        exports.sort();
        assert_eq!(exports, vec!["UEPSNetworkStack-SubnetId", "UEPSNetworkStack-VpcId"]);
        assert!(t.imports().is_empty());
    }
}
