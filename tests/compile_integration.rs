//! Integration tests for compiling templates from source text

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use stackweave::{
    compile, CompileConfig, ParameterValues, ReferenceKind, TemplateCompiler, TemplateError,
};

fn compile_json(source: &str) -> Value {
    let json = compile(source).expect("Should compile");
    serde_json::from_str(&json).expect("Should be valid JSON")
}

fn no_value() -> Value {
    json!({"Ref": "AWS::NoValue"})
}

#[test]
fn test_references_and_variables() {
    let doc = compile_json(
        r#"
--- !vars
myvar: "123"

---
Resources:
    Thing:
        Type: Custom::Thing
        Properties:
            Joined: foo - @@Bar - baz
            Plain: $$myvar
"#,
    );
    assert_eq!(
        doc["Resources"]["Thing"]["Properties"],
        json!({
            "Joined": {"Fn::Join": ["", ["foo - ", {"Ref": "Bar"}, " - baz"]]},
            "Plain": "123"
        })
    );
}

#[test]
fn test_variables_defined_after_use() {
    let doc = compile_json(
        r#"
Resources:
    Bucket:
        Type: AWS::S3::Bucket
        Properties:
            BucketName: $$prefix-logs

--- !vars
prefix: $$org-prod
org: acme
"#,
    );
    assert_eq!(
        doc["Resources"]["Bucket"]["Properties"]["BucketName"],
        json!("acme-prod-logs")
    );
}

#[test]
fn test_multiline_literal_lines() {
    let doc = compile_json(
        r#"
Resources:
    Web:
        Type: AWS::EC2::Instance
        Properties:
            UserData: |
                #!/bin/sh
                echo @@AWS::Region
"#,
    );
    assert_eq!(
        doc["Resources"]["Web"]["Properties"]["UserData"],
        json!({"Fn::Join": ["", ["#!/bin/sh\n", "echo ", {"Ref": "AWS::Region"}, "\n"]]})
    );
}

#[test]
fn test_three_conditions_are_named_in_order() {
    let doc = compile_json(
        r#"
Resources:
    A:
        Type: Custom::A
        Properties:
            Value: |
                <% If (@@Env == prod) { %>
                a
                <% } %>
    B:
        Type: Custom::B
        Properties:
            Value: |
                <% If (@@Env == staging) { %>
                b
                <% } %>
    C:
        Type: Custom::C
        Properties:
            Value: |
                <% If (@@Env != dev) { %>
                c
                <% } %>
"#,
    );

    assert_eq!(
        doc["Conditions"],
        json!({
            "IfCondition1": {"Fn::Equals": [{"Ref": "Env"}, "prod"]},
            "IfCondition2": {"Fn::Equals": [{"Ref": "Env"}, "staging"]},
            "IfCondition3": {"Fn::Not": [{"Fn::Equals": [{"Ref": "Env"}, "dev"]}]}
        })
    );
    let keys: Vec<_> = doc["Conditions"]
        .as_object()
        .expect("Conditions should be a mapping")
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys, vec!["IfCondition1", "IfCondition2", "IfCondition3"]);

    assert_eq!(
        doc["Resources"]["A"]["Properties"]["Value"],
        json!({"Fn::If": ["IfCondition1", "a\n", no_value()]})
    );
    assert_eq!(
        doc["Resources"]["C"]["Properties"]["Value"],
        json!({"Fn::If": ["IfCondition3", "c\n", no_value()]})
    );
}

#[test]
fn test_named_condition_is_not_materialized() {
    let doc = compile_json(
        r#"
Conditions:
    IsProd:
        Fn::Equals: ["@@Env", prod]
Resources:
    A:
        Type: Custom::A
        Properties:
            Value: |
                <% If (IsProd) { %>
                yes
                <% Else { %>
                no
                <% } %>
"#,
    );
    assert_eq!(
        doc["Conditions"],
        json!({"IsProd": {"Fn::Equals": [{"Ref": "Env"}, "prod"]}})
    );
    assert_eq!(
        doc["Resources"]["A"]["Properties"]["Value"],
        json!({"Fn::If": ["IsProd", "yes\n", "no\n"]})
    );
}

#[test]
fn test_if_inside_macro() {
    let doc = compile_json(
        r#"
--- !macros
toggle:
    defaultParams:
        enabled: "true"
    content:
        Value: |
            <% If ($$enabled == true) { %>
            on
            <% Else { %>
            off
            <% } %>

---
Resources:
    A:
        Type: Custom::A
        Properties: !call-macro
            macro: toggle
"#,
    );
    assert_eq!(
        doc["Conditions"],
        json!({"IfCondition1": {"Fn::Equals": ["true", "true"]}})
    );
    assert_eq!(
        doc["Resources"]["A"]["Properties"],
        json!({"Value": {"Fn::If": ["IfCondition1", "on\n", "off\n"]}})
    );
}

#[test]
fn test_merge_key_with_macros() {
    let doc = compile_json(
        r#"
--- !macros
tagged:
    defaultParams:
        team: infra
    content:
        Team: $$team
        Managed: "true"

---
Resources:
    A:
        Type: Custom::A
        Properties:
            Name: a
            <: !call-macro
                macro: tagged
                team: web
"#,
    );
    assert_eq!(
        doc["Resources"]["A"]["Properties"],
        json!({"Name": "a", "Team": "web", "Managed": "true"})
    );
}

#[test]
fn test_image_outputs() {
    let source = r#"
Resources:
    WebServer:
        Type: AWS::EC2::Instance
        Metadata:
            Stackweave:
                AMINameFormat: web-server-{version}
                PreviousAMI: "@@WebServerAMI"
    Worker:
        Type: AWS::EC2::Instance
        Metadata:
            Stackweave:
                AMINameFormat: worker-{version}
    Bucket:
        Type: AWS::S3::Bucket
"#;

    let compiled = TemplateCompiler::new(CompileConfig::new().with_for_amis(true))
        .compile_str(source)
        .expect("Should compile");

    assert_eq!(compiled.ami_outputs.len(), 2);
    let web = &compiled.ami_outputs[0];
    assert_eq!(web.resource_name, "WebServer");
    assert_eq!(web.keys.instance_id_key, "StackweaveWebServerInstanceID");
    assert_eq!(web.keys.name_format_key, "StackweaveWebServerAMINameFormat");
    assert_eq!(
        web.keys.previous_ami_key.as_deref(),
        Some("StackweaveWebServerPreviousAMI")
    );
    assert_eq!(compiled.ami_outputs[1].keys.previous_ami_key, None);

    assert_eq!(
        compiled.doc["Outputs"],
        json!({
            "StackweaveWebServerInstanceID": {
                "Description": "Instance ID for WebServer",
                "Value": {"Ref": "WebServer"}
            },
            "StackweaveWebServerAMINameFormat": {
                "Description": "Name format for the AMI for WebServer",
                "Value": "web-server-{version}"
            },
            "StackweaveWebServerPreviousAMI": {
                "Description": "Previous AMI ID created for WebServer",
                "Value": {"Ref": "WebServerAMI"}
            },
            "StackweaveWorkerInstanceID": {
                "Description": "Instance ID for Worker",
                "Value": {"Ref": "Worker"}
            },
            "StackweaveWorkerAMINameFormat": {
                "Description": "Name format for the AMI for Worker",
                "Value": "worker-{version}"
            }
        })
    );

    let compiled = TemplateCompiler::default()
        .compile_str(source)
        .expect("Should compile");
    assert!(compiled.ami_outputs.is_empty());
    assert!(!compiled.doc.contains_key("Outputs"));
}

#[test]
fn test_stack_lookups_leave_parameters_clean() {
    let compiled = TemplateCompiler::default()
        .compile_str(
            r#"
Parameters:
    SubnetId:
        Type: AWS::EC2::Subnet::Id
        Description: Subnet for the web tier
        LookupFromStack:
            Tags:
                Role: network
            Output: PublicSubnet
"#,
        )
        .expect("Should compile");

    let json: Value = serde_json::from_str(&compiled.to_json().expect("Should serialize"))
        .expect("Should be valid JSON");
    assert_eq!(
        json["Parameters"],
        json!({"SubnetId": {
            "Type": "AWS::EC2::Subnet::Id",
            "Description": "Subnet for the web tier"
        }})
    );
    assert!(compiled.stack_param_lookups.contains_key("SubnetId"));
    assert_eq!(compiled.required_params.get("SubnetId"), Some(&true));
}

#[test]
fn test_tags_from_tags_tag() {
    let compiled = TemplateCompiler::new(CompileConfig::new().with_stack_name("web"))
        .compile_str(
            r#"
Meta:
    Description: Web tier
    Tags: !tags
        Team: infra
        Environment: "@@Environment"
"#,
        )
        .expect("Should compile");

    let params = ParameterValues::new().with_value("Environment", "staging");
    let tags = compiled.resolve_tags(&params).expect("Should resolve");
    assert_eq!(tags.get("GenericStackName").map(String::as_str), Some("web"));
    assert_eq!(tags.get("Team").map(String::as_str), Some("infra"));
    assert_eq!(tags.get("Environment").map(String::as_str), Some("staging"));
    assert!(!tags.contains_key("StackVersion"));
}

#[test]
fn test_tags_with_missing_parameter() {
    let compiled = TemplateCompiler::default()
        .compile_str("Meta:\n    Tags:\n        Env: \"@@Environment\"\n")
        .expect("Should compile");
    let err = compiled
        .resolve_tags(&ParameterValues::new())
        .expect_err("Should fail");
    assert!(matches!(
        err,
        TemplateError::Reference {
            kind: ReferenceKind::Parameter,
            ..
        }
    ));
}

#[test]
fn test_compiles_are_independent() {
    let source = "Resources:\n    A:\n        Type: Custom::A\n        Properties:\n            V: |\n                <% If (@@X == y) { %>\n                v\n                <% } %>\n";
    let first = compile(source).expect("Should compile");
    let second = compile(source).expect("Should compile");
    assert_eq!(first, second);
    assert!(first.contains("IfCondition1"));
    assert!(!first.contains("IfCondition2"));
}

#[test]
fn test_syntax_error_has_location() {
    let err = TemplateCompiler::new(CompileConfig::new().with_filename("web.yaml"))
        .compile_str("Resources:\n    A:\n        Type: \"<% Else { %>\"\n")
        .expect_err("Should fail");
    match &err {
        TemplateError::Syntax { location, .. } => {
            let location = location.expect("Should be located");
            assert_eq!(location.line, 3);
        }
        other => panic!("expected a syntax error, got {:?}", other),
    }
    assert!(err.to_string().contains("web.yaml"));
}

#[test]
fn test_undefined_variable_fails_compile() {
    let err = compile("--- !vars\na: $$b\n---\nResources:\n    A:\n        Type: $$a\n")
        .expect_err("Should fail");
    assert_eq!(err.to_string(), "unknown variable \"b\"");
}
