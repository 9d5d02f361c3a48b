use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result, Tensor};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

pub fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(size, DType::U8, device)?.unsqueeze(0)
}

/// Replace masked-out attention scores with -inf before the softmax.
pub fn masked_fill(attn_weights: &Tensor, attn_mask: &Tensor) -> Result<Tensor> {
    let attn_device = attn_weights.device();
    let attn_dtype = attn_weights.dtype();
    let attn_shape = attn_weights.shape();

    let attn_mask = attn_mask.broadcast_as(attn_shape)?;
    let mask_value = Tensor::new(f32::NEG_INFINITY, attn_device)?
        .broadcast_as(attn_shape)?
        .to_dtype(attn_dtype)?;
    attn_mask.where_cond(attn_weights, &mask_value)
}
