//! Shared fixtures for unit tests.

pub(crate) const HEALTH_OUTLINE: &str = r#"# Solution Outline: Health check

## Summary

Expose a health-check endpoint.

## Deliverables

### 1. Add health endpoint

**Metadata:**
- change_type: feature
- execution_mode: automated
- domain: java
- module: api-service
- depends: none

**Profiles:**
- implementation
- module_testing

**Affected files:**
- `src/main/java/Health.java`
- `src/main/java/Routes.java`

**Change per file:**
- `src/main/java/Health.java`: new resource

**Verification:**
- Command: `mvn -q test`
- Criteria: all tests pass

**Success Criteria:**
- GET /health returns 200

### 2. Document endpoint

**Metadata:**
- change_type: documentation
- domain: java
- module: api-service
- depends: 1

**Profiles:**
- implementation

**Affected files:**
- `docs/health.md`
"#;

pub(crate) const ARCHITECTURE: &str = r#"
modules:
  api-service:
    domain: java
    path: services/api
    profiles:
      implementation:
        defaults: ["java:core-standards"]
        optionals:
          - skill: "java:rest-endpoints"
            tags: ["endpoint"]
      module_testing:
        defaults: ["java:junit"]
    commands:
      compile: "true"
      module-tests: "true"
"#;

pub(crate) fn module_index() -> crate::skills::ModuleIndex {
    serde_yaml::from_str(ARCHITECTURE).unwrap()
}
