mod auth;
mod health_check;
mod registrations;
mod sessions;
mod wallet;

pub use auth::log_out;
pub use auth::verify_login;
pub use health_check::health_check;
pub use registrations::add_guest_seat;
pub use registrations::cancel;
pub use registrations::list_session_registrations;
pub use registrations::my_registrations;
pub use registrations::patch_guests;
pub use registrations::request_status;
pub use registrations::submit_registration;
pub use sessions::create_session;
pub use sessions::get_session;
pub use sessions::list_sessions;
pub use sessions::patch_session;
pub use wallet::admin_deposit;
pub use wallet::my_ledger;
pub use wallet::my_wallet;
