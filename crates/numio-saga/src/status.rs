use serde::Serialize;

use numio_core::{
    ActivationId, ActivationState, NumioError, SmsMessage, Timestamp, UserId,
};
use numio_store::Store;

/// What the order's owner sees.
#[derive(Clone, Debug, Serialize)]
pub struct OrderStatus {
    pub activation_id: ActivationId,
    pub state: ActivationState,
    pub state_label: String,
    pub phone: Option<String>,
    pub sms_count: u64,
    pub messages: Vec<SmsView>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub can_cancel: bool,
    pub can_request_resend: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SmsView {
    pub code: String,
    pub content: String,
    pub sender: Option<String>,
    pub received_at: Timestamp,
}

impl From<SmsMessage> for SmsView {
    fn from(m: SmsMessage) -> Self {
        Self {
            code: m.code,
            content: m.content,
            sender: m.sender,
            received_at: m.received_at,
        }
    }
}

/// Owner-scoped order status with the received messages.
pub fn order_status(
    store: &Store,
    id: ActivationId,
    user: &UserId,
    resend_supported: bool,
) -> Result<OrderStatus, NumioError> {
    let activation = store
        .get_activation(id)?
        .ok_or(NumioError::ActivationNotFound(id))?;
    if activation.user_id != *user {
        return Err(NumioError::NotOrderOwner(user.clone()));
    }

    let messages: Vec<SmsView> = match activation.number_id {
        Some(number_id) => store
            .sms_for_number(number_id)?
            .into_iter()
            .map(SmsView::from)
            .collect(),
        None => Vec::new(),
    };
    let sms_count = messages.len() as u64;

    Ok(OrderStatus {
        activation_id: activation.id,
        state: activation.state,
        state_label: state_label(activation.state).to_string(),
        phone: activation.phone.clone(),
        sms_count,
        can_cancel: activation.can_cancel(),
        can_request_resend: resend_supported
            && matches!(
                activation.state,
                ActivationState::Active | ActivationState::Received
            )
            && sms_count > 0,
        created_at: activation.created_at,
        expires_at: activation.expires_at,
        messages,
    })
}

/// Human label shown in order lists.
fn state_label(state: ActivationState) -> &'static str {
    match state {
        ActivationState::Init => "Starting",
        ActivationState::Reserved => "Reserving number",
        ActivationState::Active => "Waiting for SMS",
        ActivationState::Received => "Code received",
        ActivationState::Expired => "Expired",
        ActivationState::Cancelled => "Cancelled",
        ActivationState::Failed => "Failed",
        ActivationState::Refunded => "Refunded",
    }
}
