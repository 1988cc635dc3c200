//! OpenAPI documentation for the platform API (`/api/v1/*`, `/authentication/*` and the
//! mobile money webhooks).

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api;

/// Session security scheme. Browsers send the session cookie; other clients send the same
/// token as a bearer token.
struct SessionSecurityAddon;

impl Modify for SessionSecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "session_token".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Session token returned by `POST /authentication/login`. It is set as the \
                            `ikwen_session` cookie, or can be sent in the `Authorization` header:\n\n\
                            ```\nAuthorization: Bearer YOUR_SESSION_TOKEN\n```",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    servers(
        (url = "/api/v1", description = "Platform API"),
    ),
    modifiers(&SessionSecurityAddon),
    paths(
        api::handlers::config::get_config,
        api::handlers::config::update_config,
        api::handlers::config::get_invoicing_config,
        api::handlers::config::update_invoicing_config,
        api::handlers::events::list_events,
        api::handlers::events::list_sending_reports,
        api::handlers::services::list_services,
        api::handlers::services::create_service,
        api::handlers::services::get_service,
        api::handlers::services::update_service,
        api::handlers::services::delete_service,
        api::handlers::services::join_service,
        api::handlers::members::get_current_member,
        api::handlers::members::update_current_member,
        api::handlers::members::list_members,
        api::handlers::members::get_member,
        api::handlers::members::toggle_member,
        api::handlers::members::move_member_to_group,
        api::handlers::members::get_member_permissions,
        api::handlers::members::set_member_permissions,
        api::handlers::members::get_member_profile_tags,
        api::handlers::members::set_member_profile_tags,
        api::handlers::groups::list_groups,
        api::handlers::groups::create_group,
        api::handlers::groups::get_group,
        api::handlers::groups::update_group,
        api::handlers::groups::delete_group,
        api::handlers::groups::get_group_permissions,
        api::handlers::groups::set_group_permissions,
        api::handlers::products::list_products,
        api::handlers::products::create_product,
        api::handlers::products::get_product,
        api::handlers::products::update_product,
        api::handlers::products::delete_product,
        api::handlers::subscriptions::list_subscriptions,
        api::handlers::subscriptions::create_subscription,
        api::handlers::subscriptions::get_subscription,
        api::handlers::subscriptions::change_billing_cycle,
        api::handlers::subscriptions::change_subscription_status,
        api::handlers::invoices::list_invoices,
        api::handlers::invoices::create_invoice,
        api::handlers::invoices::get_invoice,
        api::handlers::invoices::list_invoice_payments,
        api::handlers::invoices::record_payment,
        api::handlers::invoices::pay_with_wallet_balance,
        api::handlers::payment_means::list_payment_means,
        api::handlers::payment_means::create_payment_mean,
        api::handlers::payment_means::toggle_payment_mean,
        api::handlers::payment_means::set_payment_mean_credentials,
        api::handlers::mobile_money::start_mobile_money_payment,
        api::handlers::mobile_money::get_mobile_money_transaction,
        api::handlers::mobile_money::mobile_money_notification,
        api::handlers::profile_tags::list_profile_tags,
        api::handlers::profile_tags::create_profile_tag,
        api::handlers::profile_tags::update_profile_tag,
        api::handlers::profile_tags::delete_profile_tag,
        api::handlers::profile_tags::set_object_tags,
        api::handlers::revivals::list_revivals,
        api::handlers::revivals::create_revival,
        api::handlers::revivals::get_revival,
        api::handlers::revivals::update_revival,
        api::handlers::revivals::delete_revival,
        api::handlers::cyclic_revivals::list_cyclic_revivals,
        api::handlers::cyclic_revivals::create_cyclic_revival,
        api::handlers::cyclic_revivals::get_cyclic_revival,
        api::handlers::cyclic_revivals::update_cyclic_revival,
        api::handlers::cyclic_revivals::delete_cyclic_revival,
        api::handlers::auth::get_registration_info,
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::logout,
        api::handlers::auth::request_password_reset,
        api::handlers::auth::confirm_password_reset,
        api::handlers::auth::change_password,
    ),
    components(
        schemas(
            api::models::auth::RegisterRequest,
            api::models::auth::LoginRequest,
            api::models::auth::AuthResponse,
            api::models::auth::AuthSuccessResponse,
            api::models::auth::RegistrationInfo,
            api::models::auth::PasswordResetRequest,
            api::models::auth::PasswordResetResponse,
            api::models::auth::PasswordResetConfirmRequest,
            api::models::auth::ChangePasswordRequest,
            api::models::services::ServiceResponse,
            api::models::services::ConfigResponse,
            api::models::services::InvoicingConfigResponse,
            api::models::services::EventResponse,
            api::models::services::SendingReportResponse,
            api::models::members::MemberResponse,
            api::models::groups::GroupResponse,
            api::models::groups::PermissionGrant,
            api::models::groups::PermissionSet,
            api::models::billing::ProductResponse,
            api::models::billing::SubscriptionResponse,
            api::models::billing::InvoiceResponse,
            api::models::billing::PaymentResponse,
            api::models::billing::PaymentReceipt,
            api::models::billing::PaymentMeanResponse,
            api::models::billing::TransactionResponse,
            api::models::revivals::ProfileTagResponse,
            api::models::revivals::RevivalResponse,
            api::models::revivals::CyclicRevivalResponse,
        )
    ),
    tags(
        (name = "authentication", description = "Registration, login and password recovery."),
        (name = "services", description = "Hosted services (tenants), their configuration and activity."),
        (name = "members", description = "Members of the current service, their group and permissions."),
        (name = "groups", description = "Groups of the current service and the permissions they grant."),
        (name = "billing", description = "Products, subscriptions, invoices and payments.

Invoices are issued ahead of each subscription expiry, reminded, flagged overdue and finally \
suspend the subscription when left unpaid past the tolerance."),
        (name = "webhooks", description = "Notifications from mobile money operators.

A mobile money payment starts a transaction that is polled until the operator settles it. \
Operators may also call the signed URL handed to them when the transaction started."),
        (name = "config", description = "Configuration and invoicing configuration of the current service."),
        (name = "events", description = "Console events of the current member and messaging reports."),
        (name = "revivals", description = "Profile tags and the mail campaigns sent to members who share them."),
    ),
    info(
        title = "ikwen API",
        version = "1.0.0",
        description = "Multi-tenant platform API for hosted services.

## Tenancy

Most endpoints act on one service. Name it with the `X-Ikwen-Service` header; requests without \
the header use the deployment's default service.

## Authentication

Log in with `POST /authentication/login`. The session token comes back as a cookie and can also \
be sent as a bearer token.",
    ),
)]
pub struct ApiDoc;
