use kvmigrate_core::transforms::{backfill_field, drop_field, rename_field};
use kvmigrate_core::{MigrationError, Registry};
use serde_json::json;

/// The product's release history, in the order the releases shipped.
///
/// Do not sort or reorder: 2.10.0 shipped before the 2.9.3 maintenance release and a
/// store stamped 2.9.x must still pick up both. New releases go at the end.
///
/// # Errors
/// Returns [`MigrationError::InvalidDescriptor`] if a release version does not parse.
pub fn release_registry() -> Result<Registry, MigrationError> {
    Registry::builder()
        .floor("1.0.0")
        .migration(
            "1.21",
            [
                backfill_field("update_users_to_db_18", "users", "PortainerAuthorizations", json!({})),
                backfill_field("update_endpoints_to_db_18", "endpoints", "Authorizations", json!({})),
                backfill_field(
                    "update_endpoint_groups_to_db_18",
                    "endpoint_groups",
                    "Authorizations",
                    json!({}),
                ),
                backfill_field(
                    "update_registries_to_db_18",
                    "registries",
                    "UserAccessPolicies",
                    json!({}),
                ),
            ],
        )
        .migration(
            "1.22",
            [backfill_field(
                "update_settings_to_db_19",
                "settings",
                "AllowVolumeBrowserForRegularUsers",
                json!(false),
            )],
        )
        .migration(
            "1.22.1",
            [
                backfill_field("update_users_to_db_20", "users", "EndpointAuthorizations", json!({})),
                backfill_field(
                    "update_settings_to_db_20",
                    "settings",
                    "AllowDeviceMappingForRegularUsers",
                    json!(true),
                ),
                drop_field("update_schedules_to_db_20", "schedules", "EndpointSyncJob"),
            ],
        )
        .migration(
            "1.23",
            [
                backfill_field(
                    "update_resource_controls_to_db_22",
                    "resource_control",
                    "AdministratorsOnly",
                    json!(false),
                ),
                backfill_field("update_users_and_roles_to_db_22", "roles", "Priority", json!(0)),
            ],
        )
        .migration(
            "1.24",
            [
                backfill_field("update_tags_to_db_23", "tags", "Endpoints", json!({})),
                backfill_field(
                    "update_endpoints_and_endpoint_groups_to_db_23",
                    "endpoints",
                    "TagIds",
                    json!([]),
                ),
            ],
        )
        .migration(
            "1.24.1",
            [backfill_field(
                "update_settings_to_db_24",
                "settings",
                "AllowHostNamespaceForRegularUsers",
                json!(true),
            )],
        )
        .migration(
            "2.0",
            [
                backfill_field("update_settings_to_db_25", "settings", "UserSessionTimeout", json!("8h")),
                backfill_field("update_stacks_to_db_24", "stacks", "Status", json!(1)),
            ],
        )
        .migration(
            "2.1",
            [backfill_field(
                "update_endpoint_settings_to_db_25",
                "endpoints",
                "SecuritySettings",
                json!({}),
            )],
        )
        .migration(
            "2.2",
            [rename_field(
                "update_stack_resource_control_to_db_27",
                "resource_control",
                "ResourceId",
                "ResourceID",
            )],
        )
        .migration("2.6", [backfill_field("migrate_db_to_30", "endpoints", "Kubernetes", json!({}))])
        .migration(
            "2.9",
            [backfill_field(
                "migrate_db_to_32",
                "settings",
                "HelmRepositoryURL",
                json!("https://charts.bitnami.com/bitnami"),
            )],
        )
        .migration("2.9.2", [backfill_field("migrate_db_to_33", "endpoints", "Gpus", json!([]))])
        .migration("2.10.0", [backfill_field("migrate_db_to_34", "stacks", "GitConfig", json!(null))])
        .migration("2.9.3", [backfill_field("migrate_db_to_35", "users", "TokenIssueAt", json!(0))])
        .migration(
            "2.12",
            [drop_field("migrate_db_to_36", "settings", "AllowPrivilegedModeForRegularUsers")],
        )
        .migration(
            "2.13",
            [backfill_field("migrate_db_to_40", "endpoints", "EdgeCheckinInterval", json!(0))],
        )
        .migration(
            "2.14",
            [backfill_field(
                "migrate_db_to_50",
                "settings",
                "InternalAuthSettings",
                json!({"RequiredPasswordLength": 12}),
            )],
        )
        .migration(
            "2.15",
            [backfill_field("migrate_db_to_60", "edge_stacks", "UseManifestNamespaces", json!(false))],
        )
        .build()
}
